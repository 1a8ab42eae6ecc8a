mod time_unit;

pub use time_unit::TimeUnit;
