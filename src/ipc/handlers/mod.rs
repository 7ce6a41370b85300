pub mod backup;
pub mod core;
pub mod coursework;
pub mod gradebook;
pub mod reminders;
pub mod roster;
