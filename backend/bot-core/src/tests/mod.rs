mod config;
mod queue;
mod rate_limit;
mod reconnect;
mod sequence;
mod supervisor_state;
mod token_validation;
