pub mod anomaly_record;
pub mod telemetry_event;
