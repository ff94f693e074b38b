// Interpreter limits, loadable from JSON

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const FRAMES_MAX: usize = 4096;
pub const STACK_MAX: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Deepest allowed call stack, including the top-level frame
    pub max_call_depth: usize,
    /// Operand stack capacity of a single frame
    pub max_stack: usize,
    /// Stop with a runtime error after this many instructions
    pub instruction_budget: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: FRAMES_MAX,
            max_stack: STACK_MAX,
            instruction_budget: None,
        }
    }
}

impl VmConfig {
    pub fn from_json(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid config: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config '{}': {}", path.display(), e))?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let cfg = VmConfig::from_json(r#"{ "instruction_budget": 1000 }"#).unwrap();
        assert_eq!(cfg.max_call_depth, FRAMES_MAX);
        assert_eq!(cfg.max_stack, STACK_MAX);
        assert_eq!(cfg.instruction_budget, Some(1000));
    }

    #[test]
    fn test_rejects_bad_json() {
        assert!(VmConfig::from_json("{ max_call_depth: }").is_err());
    }
}
