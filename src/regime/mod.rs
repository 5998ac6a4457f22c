pub mod classifier;
pub mod persistence;

pub use classifier::{
    ClassifierConfig, FeatureVector, RegimeClassification, RegimeClassifier, RegimeLabel, FEATURE_COUNT,
};
pub use persistence::{
    PersistenceRecord, PersistenceUpdate, RegimeKey, RegimePersistenceTracker, RegimeTransition, TrackerError,
    TRANSITION_WINDOW_DAYS,
};
