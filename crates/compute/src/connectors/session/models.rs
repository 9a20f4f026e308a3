//! Wire models of the machine provisioning API (JSON:API style).

use serde::{Deserialize, Serialize};

/// Response envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    /// Response data.
    pub data: T,
}

/// Project resource, used as the identity check.
#[derive(Debug, Deserialize)]
pub struct ProjectResource {
    /// Project ID.
    pub id: String,
    /// Project attributes.
    #[serde(default)]
    pub attributes: Option<ProjectAttributes>,
}

/// Project attributes.
#[derive(Debug, Deserialize)]
pub struct ProjectAttributes {
    /// Project name.
    pub name: Option<String>,
}

/// Virtual machine resource.
#[derive(Debug, Deserialize)]
pub struct VirtualMachineResource {
    /// VM ID.
    pub id: String,
    /// VM attributes.
    pub attributes: VirtualMachineAttributes,
}

/// Virtual machine attributes.
#[derive(Debug, Deserialize)]
pub struct VirtualMachineAttributes {
    /// VM name. Carries the submission's idempotency key.
    pub name: String,
    /// Status (`Scheduling`, `Starting`, `Running`, `Stopped`, ...).
    pub status: String,
    /// Login details once the machine is up.
    pub credentials: Option<VmCredentials>,
}

/// Login details of a VM.
#[derive(Debug, Deserialize)]
pub struct VmCredentials {
    /// Username.
    pub username: Option<String>,
    /// Host address.
    pub host: Option<String>,
}

/// Request body for VM creation.
#[derive(Debug, Serialize)]
pub struct CreateVirtualMachineBody {
    /// Request data.
    pub data: CreateVirtualMachineData,
}

/// Data for VM creation.
#[derive(Debug, Serialize)]
pub struct CreateVirtualMachineData {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// VM attributes.
    pub attributes: CreateVirtualMachineAttributes,
}

/// Attributes for VM creation.
#[derive(Debug, Serialize)]
pub struct CreateVirtualMachineAttributes {
    /// VM name.
    pub name: String,
    /// Plan ID.
    pub plan: String,
    /// SSH key IDs.
    pub ssh_keys: Vec<String>,
    /// Project ID.
    pub project: String,
}

/// VM plan resource.
#[derive(Debug, Deserialize)]
pub struct VirtualMachinePlanResource {
    /// Plan ID.
    pub id: String,
    /// Plan attributes.
    pub attributes: VirtualMachinePlanAttributes,
}

/// VM plan attributes.
#[derive(Debug, Deserialize)]
pub struct VirtualMachinePlanAttributes {
    /// Plan name, e.g. `vm.h100.small`.
    pub name: Option<String>,
    /// GPU of the plan.
    pub gpu: Option<VmPlanGpu>,
    /// Per-region availability and pricing.
    #[serde(default)]
    pub regions: Vec<VmPlanRegion>,
    /// Stock level.
    pub stock_level: Option<String>,
}

/// GPU of a plan.
#[derive(Debug, Deserialize)]
pub struct VmPlanGpu {
    /// GPU model.
    pub model: Option<String>,
    /// Memory per GPU in GB.
    pub memory_gb: Option<u32>,
    /// GPU count.
    pub count: Option<u32>,
}

/// VM plan region info.
#[derive(Debug, Deserialize)]
pub struct VmPlanRegion {
    /// Pricing info.
    pub pricing: Option<VmPlanPricing>,
}

/// VM plan pricing.
#[derive(Debug, Deserialize)]
pub struct VmPlanPricing {
    /// USD pricing.
    #[serde(rename = "USD")]
    pub usd: Option<VmPlanPrice>,
}

/// VM plan price details.
#[derive(Debug, Deserialize)]
pub struct VmPlanPrice {
    /// Hourly price.
    pub hour: Option<f64>,
}

impl VirtualMachinePlanAttributes {
    /// Hourly USD price in the first region that lists one.
    #[must_use]
    pub fn hourly_usd(&self) -> f64 {
        self.regions
            .iter()
            .filter_map(|r| r.pricing.as_ref())
            .filter_map(|p| p.usd.as_ref())
            .find_map(|usd| usd.hour)
            .unwrap_or(0.0)
    }
}
