pub mod process_table;

pub use process_table::{find_matching, is_instance, is_launcher, CommandPattern, ProcessMatch, ProcessTableError};
