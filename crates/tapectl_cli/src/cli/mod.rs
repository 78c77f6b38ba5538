//! One module per subcommand family, mirroring the teacher's `cli/` layout.

pub mod run;
pub mod tapes;
