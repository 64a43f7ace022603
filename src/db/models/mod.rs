pub mod delivery_record;

pub use self::delivery_record::*;
