/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use serde::{Deserialize, Serialize};

/// Category tags understood by the built-in interceptors.
///
/// `allowed_categories` is a plain string set, so callers may add tags that
/// are not listed here; such tags are simply never triggered by anything.
pub const KNOWN_CATEGORIES: [&str; 15] = [
    "network",
    "memory",
    "cpu",
    "storage",
    "dom",
    "script",
    "worker",
    "event",
    "websocket",
    "cookie",
    "history",
    "url",
    "database",
    "resourceTiming",
    "communication",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChaosCategory {
    Network,
    Memory,
    Cpu,
    Storage,
    Dom,
    Script,
    Worker,
    Event,
    WebSocket,
    Cookie,
    History,
    Url,
    Database,
    ResourceTiming,
    Communication,
}

impl ChaosCategory {
    pub const ALL: [ChaosCategory; 15] = [
        ChaosCategory::Network,
        ChaosCategory::Memory,
        ChaosCategory::Cpu,
        ChaosCategory::Storage,
        ChaosCategory::Dom,
        ChaosCategory::Script,
        ChaosCategory::Worker,
        ChaosCategory::Event,
        ChaosCategory::WebSocket,
        ChaosCategory::Cookie,
        ChaosCategory::History,
        ChaosCategory::Url,
        ChaosCategory::Database,
        ChaosCategory::ResourceTiming,
        ChaosCategory::Communication,
    ];

    /// The tag stored in `allowed_categories` and used as the event type prefix.
    pub fn tag(self) -> &'static str {
        match self {
            ChaosCategory::Network => "network",
            ChaosCategory::Memory => "memory",
            ChaosCategory::Cpu => "cpu",
            ChaosCategory::Storage => "storage",
            ChaosCategory::Dom => "dom",
            ChaosCategory::Script => "script",
            ChaosCategory::Worker => "worker",
            ChaosCategory::Event => "event",
            ChaosCategory::WebSocket => "websocket",
            ChaosCategory::Cookie => "cookie",
            ChaosCategory::History => "history",
            ChaosCategory::Url => "url",
            ChaosCategory::Database => "database",
            ChaosCategory::ResourceTiming => "resourceTiming",
            ChaosCategory::Communication => "communication",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.tag() == tag)
    }
}

impl std::fmt::Display for ChaosCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
