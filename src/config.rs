use serde::{Deserialize, Serialize};

use crate::assignment::AssignmentKwargs;
use crate::baseline::BaselineKwargs;
use crate::error::Result;
use crate::lifecycle::SuspensionKwargs;
use crate::occlusion::OcclusionKwargs;

/// Every tunable of the pipeline. Missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortrKwargs {
    pub occlusion: OcclusionKwargs,
    pub assignment: AssignmentKwargs,
    pub suspension: SuspensionKwargs,
    pub baseline: BaselineKwargs,
}

impl SortrKwargs {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
