// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runtime-class matching. Pods name a runtime handler (e.g.
//! "kata-qemu"); the enforcement side needs the runtime class behind it
//! (e.g. "kata") to pick the right cgroup layout. The mapping is an
//! ordered table of glob patterns; the first match wins.

use anyhow::bail;
use anyhow::Result;
use glob::Pattern;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Class name of the default runtime.
pub const CRI_CLASS: &str = "cri";
/// Class name of Kata-container based runtimes.
pub const KATA_CLASS: &str = "kata";

/// A single runtime-class declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    /// Glob matched against the pod's runtime handler. The empty
    /// pattern is the catch-all default and must come last.
    #[serde(default)]
    pub handler_pattern: String,
}

/// Ordered handler-to-class mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMap {
    pub classes: Vec<Class>,
}

lazy_static! {
    static ref DEFAULT_CLASSES: ClassMap = ClassMap {
        classes: vec![
            Class {
                name: KATA_CLASS.to_string(),
                handler_pattern: "kata*".to_string(),
            },
            Class {
                name: CRI_CLASS.to_string(),
                handler_pattern: String::new(),
            },
        ],
    };
}

impl Default for ClassMap {
    fn default() -> Self {
        DEFAULT_CLASSES.clone()
    }
}

impl ClassMap {
    /// Find the class for a runtime handler. The empty handler is
    /// always the default CRI class; otherwise the first class whose
    /// pattern matches wins, an empty pattern matching anything.
    pub fn match_handler(&self, handler: &str) -> Option<&str> {
        if handler.is_empty() {
            return Some(CRI_CLASS);
        }
        for class in &self.classes {
            if class.handler_pattern.is_empty() {
                return Some(&class.name);
            }
            if let Ok(pattern) = Pattern::new(&class.handler_pattern) {
                if pattern.matches(handler) {
                    return Some(&class.name);
                }
            }
        }
        None
    }

    /// Reject tables with syntactically bad globs or a misplaced
    /// catch-all. Called at configuration load, before the table is
    /// applied.
    pub fn validate(&self) -> Result<()> {
        for (idx, class) in self.classes.iter().enumerate() {
            if class.handler_pattern.is_empty() {
                if idx != self.classes.len() - 1 {
                    bail!(
                        "invalid configuration: default (empty) handler pattern \
                         for class {:?} must be last",
                        class.name
                    );
                }
                continue;
            }
            if let Err(e) = Pattern::new(&class.handler_pattern) {
                bail!(
                    "invalid configuration: bad handler pattern {:?} for class {:?}: {}",
                    class.handler_pattern,
                    class.name,
                    e
                );
            }
        }
        Ok(())
    }
}
