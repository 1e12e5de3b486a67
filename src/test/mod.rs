mod harness;

mod command_queue;
mod config;
mod object_store;
mod protocol;
mod scenarios;
mod transport;
