use crate::errors::Result;
use crate::events::Outcome;

#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A job task handed its slot back.
    Finished { group: usize, result: Result<Outcome> },
}
