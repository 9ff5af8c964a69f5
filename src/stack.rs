//! Stack detection
//!
//! Classifies a workspace into one of the supported runtime stacks by the
//! marker files it contains.

use crate::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

/// Runtime stack of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stack {
    Static,
    Node,
    Php,
    Python,
}

impl Stack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stack::Static => "static",
            Stack::Node => "node",
            Stack::Php => "php",
            Stack::Python => "python",
        }
    }

    /// Port the application listens on inside the container
    pub fn internal_port(&self) -> u16 {
        match self {
            Stack::Node => 3000,
            Stack::Python => 5000,
            Stack::Static | Stack::Php => 80,
        }
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown stack '{0}' (expected static, node, php, python or auto)")]
pub struct UnknownStack(pub String);

impl From<UnknownStack> for OrchestratorError {
    fn from(err: UnknownStack) -> Self {
        OrchestratorError::validation(err.to_string())
    }
}

impl FromStr for Stack {
    type Err = UnknownStack;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" | "html" => Ok(Stack::Static),
            "node" | "nodejs" => Ok(Stack::Node),
            "php" => Ok(Stack::Php),
            "python" | "py" => Ok(Stack::Python),
            _ => Err(UnknownStack(s.to_string())),
        }
    }
}

/// Requested stack: detect from the workspace, or use as given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackHint {
    Auto,
    Fixed(Stack),
}

impl StackHint {
    /// Parse an optional request field; absent, empty and `auto` all detect
    pub fn parse(value: Option<&str>) -> Result<Self, UnknownStack> {
        match value.map(str::trim) {
            None | Some("") => Ok(StackHint::Auto),
            Some(v) if v.eq_ignore_ascii_case("auto") => Ok(StackHint::Auto),
            Some(v) => v.parse().map(StackHint::Fixed),
        }
    }
}

const PYTHON_MARKERS: [&str; 3] = ["requirements.txt", "Pipfile", "pyproject.toml"];

/// Resolve the stack for a workspace.
///
/// A fixed hint wins. Otherwise `package.json` means node, `composer.json` or
/// a top-level `.php` file means php, a Python manifest means python, and
/// anything else is served as static files.
pub fn detect(workspace: &Path, hint: StackHint) -> Stack {
    if let StackHint::Fixed(stack) = hint {
        debug!(stack = %stack, "Using requested stack");
        return stack;
    }

    let stack = if workspace.join("package.json").is_file() {
        Stack::Node
    } else if workspace.join("composer.json").is_file() || has_php_file(workspace) {
        Stack::Php
    } else if PYTHON_MARKERS.iter().any(|m| workspace.join(m).is_file()) {
        Stack::Python
    } else {
        Stack::Static
    };

    info!(path = %workspace.display(), stack = %stack, "Detected stack");
    stack
}

fn has_php_file(workspace: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(workspace) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let path = entry.path();
        path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("php"))
    })
}
