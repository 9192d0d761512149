// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/gro/config.yaml"));
        paths.push(home.join(".config/gro/config.yml"));
        paths.push(home.join(".gro/config.yaml"));
    }

    // Workspace-local
    paths.push(PathBuf::from(".gro/config.yaml"));
    paths.push(PathBuf::from(".gro.yaml"));
    paths.push(PathBuf::from("gro.yaml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
///
/// An explicit path (the `--config` flag or, read at call time, the
/// `GRO_CONFIG_FILE` env var) is applied last and wins.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_file(&mut merged, &path)?;
        }
    }

    let env_path = std::env::var("GRO_CONFIG_FILE").ok().map(PathBuf::from);
    let explicit = extra.map(Path::to_path_buf).or(env_path);
    if let Some(p) = explicit {
        debug!(path = %p.display(), "loading explicit config");
        merge_file(&mut merged, &p)?;
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

fn merge_file(dst: &mut serde_yaml::Value, path: &Path) -> anyhow::Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_yaml(dst, layer);
    Ok(())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
