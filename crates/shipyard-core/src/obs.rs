//! Structured observability hooks for release-train lifecycle events.
//!
//! This module provides:
//! - An invocation-scoped tracing span via the `RunSpan` RAII guard
//! - Emission functions for build, manifest, signing, SBOM and batch events
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::{info, warn};

/// RAII guard that enters an invocation-scoped span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("3f0c...", "daily");
/// // every event below carries run_id and command
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, command: &str) -> Self {
        let span = tracing::info_span!("shipyard.run", run_id = %run_id, command = %command);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_run_started(run_id: &str, scenario: &str, image: &str, versions: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        scenario = %scenario,
        image = %image,
        versions = versions,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, failed: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        failed = failed,
        success = success,
    );
}

pub fn emit_build_started(image_ref: &str, platforms: &str) {
    info!(event = "build.started", image_ref = %image_ref, platforms = %platforms);
}

pub fn emit_build_finished(image_ref: &str, duration_ms: u64, skipped: bool) {
    info!(
        event = "build.finished",
        image_ref = %image_ref,
        duration_ms = duration_ms,
        skipped = skipped,
    );
}

pub fn emit_manifest_published(manifest: &str, amended: usize) {
    info!(event = "manifest.published", manifest = %manifest, amended = amended);
}

pub fn emit_image_signed(reference: &str) {
    info!(event = "image.signed", reference = %reference);
}

pub fn emit_image_verified(reference: &str, verified: bool) {
    info!(event = "image.verified", reference = %reference, verified = verified);
}

pub fn emit_sbom_uploaded(key: &str, asset_group: &str) {
    info!(event = "sbom.uploaded", key = %key, asset_group = %asset_group);
}

/// Best-effort SBOM step failed; never fatal.
pub fn emit_sbom_failed(image_ref: &str, platform: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "sbom.failed",
        image_ref = %image_ref,
        platform = %platform,
        error = %error,
    );
}

pub fn emit_batch_drained(pool: &str, total: usize, failed: usize) {
    info!(event = "batch.drained", pool = %pool, total = total, failed = failed);
}
