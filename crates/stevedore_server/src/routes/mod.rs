pub mod events;
pub mod favorites;
pub mod jobs;
pub mod meta;
pub mod profiles;
pub mod uploads;
