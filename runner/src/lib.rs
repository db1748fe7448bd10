pub mod builder;
pub mod config;
pub mod coordinator;
pub mod executors;
pub mod expansion;
pub mod expression;
pub mod mutation;
pub mod naming;
pub mod sync;
pub mod template;
pub mod tree;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod expansion_test;
#[cfg(test)]
mod naming_test;
#[cfg(test)]
mod sync_test;
