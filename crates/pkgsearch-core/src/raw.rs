//! Raw upstream records and their conversion into [`PackageRecord`]s.
//!
//! Upstream metadata is loosely shaped: licenses and maintainers arrive as
//! strings, objects, or arrays of either, and keys come in both snake_case
//! and camelCase. [`RawPackage::into_package`] normalizes all of that once,
//! computes the content hash, and emits the package's dependency edges.

use serde::Deserialize;
use serde_json::Value;

use crate::error::RawPackageError;
use crate::hash::content_hash;
use crate::models::{
    Architecture, DependencyEdge, DependencyKind, License, Maintainer, OneOrMany, PackageRecord,
    StatusFlags,
};

/// Maximum maintainers kept per package.
pub const MAX_MAINTAINERS: usize = 10;

const SYSTEM_SUFFIXES: &[&str] = &["linux", "darwin", "windows", "freebsd"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPackage {
    #[serde(default, alias = "attributePath")]
    pub attribute_path: Option<String>,
    #[serde(default, alias = "packageName")]
    pub name: Option<String>,
    #[serde(default)]
    pub pname: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "longDescription")]
    pub long_description: Option<String>,
    #[serde(default)]
    pub homepage: Value,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub broken: Option<bool>,
    #[serde(default)]
    pub unfree: Option<bool>,
    #[serde(default)]
    pub insecure: Option<bool>,
    #[serde(default)]
    pub unsupported: Option<bool>,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default, alias = "mainProgram")]
    pub main_program: Option<String>,
    #[serde(default)]
    pub license: Value,
    #[serde(default)]
    pub maintainers: Value,
    #[serde(default)]
    pub platforms: Value,
    #[serde(default, alias = "buildInputs")]
    pub build_inputs: Vec<String>,
    #[serde(default, alias = "propagatedBuildInputs")]
    pub propagated_build_inputs: Vec<String>,
}

/// A converted package plus the edges it declares.
#[derive(Debug, Clone)]
pub struct IngestedPackage {
    pub record: PackageRecord,
    pub edges: Vec<DependencyEdge>,
}

impl RawPackage {
    /// Normalize into a [`PackageRecord`]. `position` is the record's index
    /// in the input and only used for error reporting.
    pub fn into_package(self, position: usize) -> Result<IngestedPackage, RawPackageError> {
        let attribute_path = non_empty(self.attribute_path).unwrap_or_default();
        let name = non_empty(self.pname)
            .or_else(|| non_empty(self.name.clone()))
            .or_else(|| attribute_path.rsplit('.').next().map(str::to_string))
            .filter(|n| !n.is_empty());
        let Some(name) = name else {
            return Err(RawPackageError::MissingIdentity(position));
        };
        let version = non_empty(self.version).unwrap_or_default();
        let id = package_id(&attribute_path, &name, &version);

        let mut licenses = OneOrMany::from(&self.license)
            .map(parse_license)
            .into_vec();
        licenses.sort();
        licenses.dedup_by(|a, b| a.short_name == b.short_name && a.spdx_id == b.spdx_id);

        let mut maintainers = OneOrMany::from(&self.maintainers)
            .map(parse_maintainer)
            .into_vec();
        maintainers.sort();
        maintainers.dedup_by(|a, b| a.name == b.name && a.email == b.email && a.github == b.github);
        maintainers.truncate(MAX_MAINTAINERS);

        let mut platforms = OneOrMany::from(&self.platforms)
            .map(|v| {
                v.as_str()
                    .filter(|s| !s.is_empty())
                    .map(|s| Architecture { name: s.to_string() })
            })
            .into_vec();
        platforms.sort();
        platforms.dedup();

        let homepage = match OneOrMany::from(&self.homepage) {
            OneOrMany::None => None,
            OneOrMany::Single(v) => v.as_str().map(str::to_string),
            OneOrMany::List(items) => items.first().and_then(|v| v.as_str()).map(str::to_string),
        }
        .filter(|h| !h.is_empty());

        let category = match non_empty(self.category) {
            Some(explicit) => normalize_category(&explicit),
            None => classify_by_attribute_path(&attribute_path).to_string(),
        };

        let flags = StatusFlags {
            broken: self.broken.unwrap_or(false),
            unfree: self.unfree.unwrap_or(false),
            insecure: self.insecure.unwrap_or(false),
            unsupported: self.unsupported.unwrap_or(false),
            available: self.available.unwrap_or(true),
        };

        let mut record = PackageRecord {
            id: id.clone(),
            name,
            version,
            attribute_path,
            description: non_empty(self.description),
            long_description: non_empty(self.long_description),
            homepage,
            category,
            flags,
            main_program: non_empty(self.main_program),
            content_hash: String::new(),
            embedding: None,
            licenses,
            maintainers,
            platforms,
        };
        record.content_hash = content_hash(&record);

        let edges = self
            .build_inputs
            .into_iter()
            .map(|t| (t, DependencyKind::Build))
            .chain(
                self.propagated_build_inputs
                    .into_iter()
                    .map(|t| (t, DependencyKind::Propagated)),
            )
            .filter(|(target, _)| !target.trim().is_empty())
            .map(|(target, kind)| DependencyEdge {
                source_id: id.clone(),
                target_id: target.trim().to_string(),
                kind,
            })
            .collect();

        Ok(IngestedPackage { record, edges })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn str_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Package id: the attribute path without a trailing system segment, or
/// `name@version` when there is no attribute path.
pub fn package_id(attribute_path: &str, name: &str, version: &str) -> String {
    let attr = attribute_path.trim();
    if attr.is_empty() {
        return format!("{}@{}", name, version);
    }
    if let Some((head, last)) = attr.rsplit_once('.') {
        // Only a `<arch>-<os>` segment counts; `linux_6_1` is a package.
        if SYSTEM_SUFFIXES
            .iter()
            .any(|sys| last.ends_with(&format!("-{}", sys)))
        {
            return head.to_string();
        }
    }
    attr.to_string()
}

fn parse_license(value: &Value) -> Option<License> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(License {
            short_name: s.trim().to_string(),
            spdx_id: None,
            full_name: None,
            url: None,
            free: None,
        }),
        Value::Object(obj) => {
            let spdx_id = str_field(obj, &["spdx_id", "spdxId"]);
            let full_name = str_field(obj, &["full_name", "fullName"]);
            let short_name = str_field(obj, &["short_name", "shortName"])
                .or_else(|| spdx_id.clone())
                .or_else(|| full_name.clone())?;
            Some(License {
                short_name,
                spdx_id,
                full_name,
                url: str_field(obj, &["url"]),
                free: obj.get("free").and_then(Value::as_bool),
            })
        }
        _ => None,
    }
}

fn parse_maintainer(value: &Value) -> Option<Maintainer> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(Maintainer {
            name: Some(s.trim().to_string()),
            email: None,
            github: None,
            github_id: None,
        }),
        Value::Object(obj) => {
            let maintainer = Maintainer {
                name: str_field(obj, &["name"]),
                email: str_field(obj, &["email"]),
                github: str_field(obj, &["github"]),
                github_id: obj
                    .get("github_id")
                    .or_else(|| obj.get("githubId"))
                    .and_then(Value::as_u64),
            };
            if maintainer.name.is_none() && maintainer.email.is_none() && maintainer.github.is_none()
            {
                None
            } else {
                Some(maintainer)
            }
        }
        _ => None,
    }
}

const CATEGORY_ALIASES: &[(&str, &str)] = &[
    ("applications.editors", "editors"),
    ("applications.graphics", "graphics"),
    ("applications.networking", "networking"),
    ("applications.science", "science"),
    ("applications.system", "system"),
    ("applications.virtualization", "virtualization"),
    ("applications.audio", "audio"),
    ("applications.video", "video"),
    ("applications.office", "office"),
    ("applications.misc", "applications"),
    ("development.tools", "development"),
    ("development.libraries", "libraries"),
    ("development.compilers", "compilers"),
    ("development.interpreters", "interpreters"),
    ("development.haskell-modules", "haskell"),
    ("development.python-modules", "python"),
    ("development.node-packages", "javascript"),
    ("development.perl-modules", "perl"),
    ("development.ruby-modules", "ruby"),
    ("tools.system", "system-tools"),
    ("tools.networking", "networking-tools"),
    ("tools.text", "text-tools"),
    ("tools.misc", "tools"),
    ("tools.security", "security"),
    ("tools.filesystems", "filesystems"),
    ("tools.backup", "backup"),
];

/// Checked in order; the first rule with a matching substring wins.
const PATH_RULES: &[(&[&str], &str)] = &[
    (&["python"], "python"),
    (&["haskellpackages", "haskell.packages"], "haskell"),
    (&["nodepackages", "node_"], "javascript"),
    (&["perlpackages", "perl5", "perl."], "perl"),
    (&["rubypackages", "rubygems"], "ruby"),
    (&["ocamlpackages", "ocaml-"], "ocaml"),
    (&["luapackages", "lua"], "lua"),
    (&["go-modules", "buildgomodule"], "go"),
    (&["rustpackages", "cargo"], "rust"),
    (&["editor", "vim", "emacs", "helix"], "editors"),
    (&["browser", "firefox", "chromium", "webkit"], "browsers"),
    (&["game", "steam", "lutris"], "games"),
    (&["server", "nginx", "httpd", "postgresql", "mysql"], "servers"),
    (&["font", "ttf", "otf"], "fonts"),
    (&["media", "video", "audio", "ffmpeg"], "multimedia"),
    (&["security", "crypto", "ssl", "gpg", "password"], "security"),
    (&["compiler", "gcc", "clang", "llvm"], "compilers"),
    (&["lib"], "libraries"),
    (&["tool", "util", "cli"], "tools"),
    (&["devel", "build", "cmake"], "development"),
];

/// Map an explicit upstream category to its display name.
pub fn normalize_category(category: &str) -> String {
    let lower = category.trim().to_lowercase();
    CATEGORY_ALIASES
        .iter()
        .find(|(from, _)| *from == lower)
        .map(|(_, to)| to.to_string())
        .unwrap_or(lower)
}

/// Derive a category from the attribute path when none is declared.
pub fn classify_by_attribute_path(attribute_path: &str) -> &'static str {
    let lower = attribute_path.to_lowercase();
    PATH_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, category)| *category)
        .unwrap_or("misc")
}
