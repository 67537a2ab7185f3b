pub mod advertise;
pub mod parser;
pub mod query;
pub mod resolvectl;
pub mod selfcheck;
pub mod source;
