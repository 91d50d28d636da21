mod actor;
mod messages;

pub(crate) use self::actor::BatchCoordinator;
