use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lookup::{JsonLookup, SanitizeError};

/// Canonical report as it travels through the queue and into storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportSubmission {
    pub system: SystemInfo,
    pub minecraft: ServerInfo,
    pub plugins: Vec<PluginInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub java: String,
    pub cores: i32,
    pub memory: i64,
    pub os: OsInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
    pub arch: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub players: i32,
    pub online_mode: bool,
    #[serde(rename = "mod")]
    pub server_mod: ServerMod,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMod {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<CustomData>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    pub name: String,
    pub value: Value,
}

/// Rebuilds a raw client document into a [`ReportSubmission`], keeping only
/// the known keys.
///
/// Every mandatory field must be present with the right type. Entries of
/// `plugins` and of a plugin's `data` that are not objects are skipped.
pub struct SubmissionSanitizer<'a> {
    lookup: JsonLookup<'a>,
}

impl<'a> SubmissionSanitizer<'a> {
    pub fn new(raw: &'a Value) -> Self {
        Self {
            lookup: JsonLookup::new(raw),
        }
    }

    pub fn sanitize(&self) -> Result<ReportSubmission, SanitizeError> {
        let lookup = &self.lookup;
        lookup.object("system")?;
        lookup.object("minecraft")?;

        Ok(ReportSubmission {
            system: SystemInfo {
                java: lookup.string("system.java")?,
                cores: lookup.int("system.cores")?,
                memory: lookup.long("system.memory")?,
                os: OsInfo {
                    name: lookup.string("system.os.name")?,
                    version: lookup.string("system.os.version")?,
                    arch: lookup.string("system.os.arch")?,
                },
            },
            minecraft: ServerInfo {
                version: lookup.string("minecraft.version")?,
                players: lookup.int("minecraft.players")?,
                online_mode: lookup.boolean("minecraft.online_mode")?,
                server_mod: ServerMod {
                    name: lookup.string("minecraft.mod.name")?,
                    version: lookup.string("minecraft.mod.version")?,
                },
            },
            plugins: self.plugins()?,
        })
    }

    fn plugins(&self) -> Result<Vec<PluginInfo>, SanitizeError> {
        let mut plugins = Vec::new();
        for entry in self.lookup.array("plugins")? {
            if !entry.is_object() {
                continue;
            }
            let plugin = JsonLookup::new(entry);
            let data = if plugin.contains("data") {
                Some(custom_data(&plugin)?)
            } else {
                None
            };
            plugins.push(PluginInfo {
                name: plugin.string("name")?,
                version: plugin.string("version")?,
                data,
            });
        }
        Ok(plugins)
    }
}

fn custom_data(plugin: &JsonLookup<'_>) -> Result<Vec<CustomData>, SanitizeError> {
    let mut entries = Vec::new();
    for entry in plugin.array("data")? {
        if !entry.is_object() {
            continue;
        }
        let item = JsonLookup::new(entry);
        let value = item.value("value").cloned().ok_or_else(|| SanitizeError {
            path: "value".to_owned(),
            expected: "present",
        })?;
        entries.push(CustomData {
            name: item.string("name")?,
            value,
        });
    }
    Ok(entries)
}

impl ReportSubmission {
    pub fn sanitize(raw: &Value) -> Result<Self, SanitizeError> {
        SubmissionSanitizer::new(raw).sanitize()
    }
}
