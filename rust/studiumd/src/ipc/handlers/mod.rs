pub mod classrooms;
pub mod core;
pub mod setup;
pub mod timetables;
pub mod users;
