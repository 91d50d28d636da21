pub mod child;
pub(crate) mod coordinator;
