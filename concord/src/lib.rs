// The launcher half of the system: the test configuration file that
// describes a cluster and its scripted clients, the bootstrap that turns
// one into running replicas, and the client driver that walks a script
// against a replica's request/response port.

pub mod client;
pub mod cluster;
pub mod config;

#[cfg(test)]
mod test;
