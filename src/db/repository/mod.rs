pub mod delivery_record_repository;

pub use delivery_record_repository::{DeliveryRecordRepository, DeliveryUpdate};
