//! Per-boot stage timings.

use serde::Serialize;

use super::types::BootStep;
use crate::pipeline::PipelineMetrics;

/// Wall-clock duration of each boot step, in milliseconds.
///
/// A step is `None` when the run never reached it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootMetrics {
    pub ensure_workspace_ms: Option<u128>,
    pub resolve_flavor_ms: Option<u128>,
    pub resolve_image_ms: Option<u128>,
    pub allocate_address_ms: Option<u128>,
    pub render_descriptor_ms: Option<u128>,
    pub fetch_image_ms: Option<u128>,
    pub start_domain_ms: Option<u128>,
    pub record_instance_ms: Option<u128>,
    pub total_ms: u128,
}

impl BootMetrics {
    pub fn from_pipeline(pipeline: &PipelineMetrics) -> Self {
        let step = |s: BootStep| pipeline.task_elapsed(s.as_str()).map(|d| d.as_millis());
        Self {
            ensure_workspace_ms: step(BootStep::EnsureWorkspace),
            resolve_flavor_ms: step(BootStep::ResolveFlavor),
            resolve_image_ms: step(BootStep::ResolveImage),
            allocate_address_ms: step(BootStep::AllocateAddress),
            render_descriptor_ms: step(BootStep::RenderDescriptor),
            fetch_image_ms: step(BootStep::FetchImage),
            start_domain_ms: step(BootStep::StartDomain),
            record_instance_ms: step(BootStep::RecordInstance),
            total_ms: pipeline.elapsed.as_millis(),
        }
    }

    pub fn log_stages(&self, instance_name: &str) {
        tracing::info!(
            instance = %instance_name,
            total_ms = self.total_ms,
            ensure_workspace_ms = ?self.ensure_workspace_ms,
            resolve_flavor_ms = ?self.resolve_flavor_ms,
            resolve_image_ms = ?self.resolve_image_ms,
            allocate_address_ms = ?self.allocate_address_ms,
            render_descriptor_ms = ?self.render_descriptor_ms,
            fetch_image_ms = ?self.fetch_image_ms,
            start_domain_ms = ?self.start_domain_ms,
            record_instance_ms = ?self.record_instance_ms,
            "Boot stage timings"
        );
    }
}
