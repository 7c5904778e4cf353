//! Integration test suite for pixsweep.
//!
//! These tests run whole campaigns against a temporary detector tree and
//! generator inputs. Tool invocations go through an in-process stub runner,
//! except in `tool_scripts`, which drives real shell-script stand-ins for
//! the simulator, reconstructor and merge tool on unix.
//!
//! # Test Categories
//!
//! - `campaign_e2e`: complete runs, partial failures and config errors
//! - `ordering`: dependency order and retry bounds seen through events
//! - `tool_scripts`: the system process runner against executable stubs

mod fixtures;

mod campaign_e2e;
mod ordering;
mod tool_scripts;
