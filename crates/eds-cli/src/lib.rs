pub mod items;
pub mod remote;
pub mod submit;

pub use items::{parse_items, CommandLineRequest, ItemsError, ParsedItems};
pub use submit::{submit, SubmitError, SubmitOptions, SubmitOutcome};
