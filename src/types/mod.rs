pub mod batch;
pub mod job;
pub mod mutate;
pub mod protocol;
pub mod serialisable;
pub mod states;
