mod helpers;

mod config;
mod connection;
mod control_server;
mod dispatch;
mod ipc;
mod supervisor;
mod token_store;
mod upstream;
mod worker;
