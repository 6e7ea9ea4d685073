// Pure z-score classification
pub mod anomaly_detection;

// Window fetch, detection and persistence for one pair
pub mod detection;

// Discovery of recently active pairs
pub mod pair_scanner;

pub use detection::{DetectionReport, DetectionService, DetectionSummary, PersistedFinding};
pub use pair_scanner::PairScanner;
