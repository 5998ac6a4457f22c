pub mod bandit;
pub mod calibration;
pub mod decision_pack;
pub mod pack_generator;
pub mod position_sizer;

// Re-export main types for convenience
pub use bandit::{ActionBandit, BanditError, BanditKey, BanditRegistry, BanditState, DecisionDimension, RewardMode};
pub use calibration::{
    CachedCalibration, CalibrationBand, CalibrationCeiling, CalibrationError, CalibrationSource,
    ConfidenceCalibrationService,
};
pub use decision_pack::{DecisionPack, Direction, ExecutionOutcome, ExecutionStatus, PackEconomics, PackRejection};
pub use pack_generator::{
    CandidateOutcome, GenerationReport, PackGenerator, PackGeneratorConfig, SignalCandidate, SkipReason,
};
pub use position_sizer::{PositionSize, PositionSizer, PositionSizerConfig, SizeCategory, SizingInput};
