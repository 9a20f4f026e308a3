//! Machine-provisioning provider driven over SSH.
//!
//! A job rents one GPU machine. Once the machine reports `Running` and
//! accepts a session, the training command is started detached in
//! `~/compute-job`, its output goes to `train.log` and its exit status to
//! `exit_code`. Status polls read `exit_code`, log streaming tails
//! `train.log` by byte offset, and the artifact is the contents of
//! `~/compute-job/output` streamed back as a gzipped tarball.
//!
//! Deleting the machine is the only way to stop billing, so cancel and
//! release both delete it.

mod client;
mod models;
mod shell;

pub use client::SessionConnector;
pub use shell::{shell_quote, CommandOutput, RemoteSession, SshSession};
