//! Tests for the control, recovery and utility commands.

use std::path::PathBuf;

use super::parse;
use crate::cli::{Cli, CliCommand};
use clap::Parser;

#[test]
fn cli_parse_status() {
    match parse(&["ferry", "status"]) {
        CliCommand::Status => {}
        _ => panic!("expected Status"),
    }
}

#[test]
fn cli_parse_pause() {
    match parse(&["ferry", "pause", "0b6c"]) {
        CliCommand::Pause { id } => assert_eq!(id, "0b6c"),
        _ => panic!("expected Pause"),
    }
}

#[test]
fn cli_parse_resume() {
    match parse(&["ferry", "resume", "abc"]) {
        CliCommand::Resume { id } => assert_eq!(id, "abc"),
        _ => panic!("expected Resume"),
    }
}

#[test]
fn cli_parse_cancel() {
    match parse(&["ferry", "cancel", "abc"]) {
        CliCommand::Cancel { id, keep } => {
            assert_eq!(id, "abc");
            assert!(!keep);
        }
        _ => panic!("expected Cancel"),
    }
    match parse(&["ferry", "cancel", "abc", "--keep"]) {
        CliCommand::Cancel { keep, .. } => assert!(keep),
        _ => panic!("expected Cancel --keep"),
    }
}

#[test]
fn cli_pause_requires_id() {
    assert!(Cli::try_parse_from(["ferry", "pause"]).is_err());
}

#[test]
fn cli_parse_resumable_and_history() {
    assert!(matches!(parse(&["ferry", "resumable"]), CliCommand::Resumable));
    assert!(matches!(parse(&["ferry", "history"]), CliCommand::History));
}

#[test]
fn cli_parse_recover() {
    match parse(&["ferry", "recover"]) {
        CliCommand::Recover { ids, jobs } => {
            assert!(ids.is_empty());
            assert!(jobs.is_none());
        }
        _ => panic!("expected Recover"),
    }
    match parse(&["ferry", "recover", "a", "b", "-j", "2"]) {
        CliCommand::Recover { ids, jobs } => {
            assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
            assert_eq!(jobs, Some(2));
        }
        _ => panic!("expected Recover with ids"),
    }
}

#[test]
fn cli_parse_probe() {
    match parse(&["ferry", "probe", "https://example.com/x"]) {
        CliCommand::Probe { url, timeout } => {
            assert_eq!(url, "https://example.com/x");
            assert_eq!(timeout, 15);
        }
        _ => panic!("expected Probe"),
    }
}

#[test]
fn cli_parse_checksum() {
    match parse(&["ferry", "checksum", "/path/to/file.bin", "--expect", "abc"]) {
        CliCommand::Checksum { path, expect } => {
            assert_eq!(path, PathBuf::from("/path/to/file.bin"));
            assert_eq!(expect.as_deref(), Some("abc"));
        }
        _ => panic!("expected Checksum"),
    }
}
