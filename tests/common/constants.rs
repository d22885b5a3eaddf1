//! Shared constants for end-to-end tests
//!
//! When upload names or timing assumptions change, update only this file.
#![allow(dead_code)]

// ============================================================================
// Upload Names
// ============================================================================

/// Track to master
pub const TARGET_FILENAME: &str = "song.wav";

/// Track to match against
pub const REFERENCE_FILENAME: &str = "reference.wav";

/// Name the mastered WAV is served under
pub const MASTERED_WAV_FILENAME: &str = "mastered_song.wav";

// ============================================================================
// Test Timeouts and Configuration
// ============================================================================

/// Maximum time to wait for server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Timeout for individual HTTP requests (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Polling interval when waiting for server ready (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 50;

/// Maximum time to wait for a job to reach a terminal status (milliseconds)
pub const JOB_COMPLETION_TIMEOUT_MS: u64 = 10_000;

/// Polling interval when waiting for a job (milliseconds)
pub const JOB_POLL_INTERVAL_MS: u64 = 20;

// ============================================================================
// Test File Sizes
// ============================================================================

/// Samples in the generated test WAV (16-bit mono)
pub const TEST_WAV_SAMPLES: usize = 4410;

/// Size of the generated test WAV, header included (bytes)
pub const TEST_WAV_SIZE_BYTES: usize = 44 + TEST_WAV_SAMPLES * 2;
