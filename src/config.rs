//! Configuration constants for the shard worker
//!
//! This module centralizes the default timings used by the coordination
//! components. Every value here is only a default: the runner copies them into
//! an explicit `WorkerConfig` which is what the components actually read.

use std::time::Duration;

// ============================================================================
// Run Identity / Marker Configuration
// ============================================================================

/// How often followers re-read a marker written by worker 0
pub const MARKER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long followers wait for the run identity marker
///
/// Worker 0 writes the marker before doing anything expensive, so two minutes
/// covers cold starts of the leader without letting a missing leader stall the
/// followers for long.
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(120); // 2 minutes

/// Clock skew allowed between a follower's start and the marker's `created_at`
///
/// A marker older than the follower's start by more than this is left over
/// from a previous invocation and is ignored.
pub const IDENTITY_MARKER_TOLERANCE: Duration = Duration::from_secs(30);

// ============================================================================
// Workspace Cache Configuration
// ============================================================================

/// How long followers wait for worker 0 to finish the one-time workspace setup
///
/// Covers a clone plus a full dependency install on the leader.
pub const WORKSPACE_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

/// Directories left out of the workspace archive
pub const WORKSPACE_EXCLUDES: &[&str] = &[".git", "playwright-report", "test-results", "blob-report"];

// ============================================================================
// Completion Barrier Configuration
// ============================================================================

pub const BARRIER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on how long worker 0 waits for every shard to publish
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(1200); // 20 minutes

// ============================================================================
// Store Retry Configuration
// ============================================================================

pub const MAX_RETRIES: u32 = 5;

/// Fixed delay between attempts of a failing store operation
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Merge Configuration
// ============================================================================

/// Attempts of the whole merge sequence, absorbing listing lag after the barrier
pub const MERGE_ATTEMPTS: u32 = 3;

pub const MERGE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Lifetime of the signed links printed for the final report
pub const SIGNED_LINK_TTL: Duration = Duration::from_secs(7200); // 2 hours

// ============================================================================
// Shard Discovery
// ============================================================================

/// Target number of tests per shard when recommending a shard count
pub const TESTS_PER_SHARD: usize = 5;

pub const MAX_RECOMMENDED_SHARDS: usize = 50;
