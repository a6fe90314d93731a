//! portals.conf discovery and parsing
//!
//! xdg-desktop-portal resolves backend preferences from a small keyfile
//! ("portals.conf"). Several copies may exist; precedence is user config
//! over /etc over /usr/share, and within each tier the desktop-specific
//! `{desktop}-portals.conf` beats the generic `portals.conf`. Keys merge
//! per-key first-wins across that ordered list.

use std::{collections::BTreeMap, fs, path::PathBuf};

use tracing::{debug, trace};

use crate::facts::state::PortalsConfig;

/// Candidate portals.conf paths, highest precedence first.
///
/// `desktop_raw` is the raw `XDG_CURRENT_DESKTOP` value; each colon-separated
/// segment contributes a `{segment}-portals.conf` candidate ahead of the
/// generic `portals.conf` within every tier.
pub fn config_paths(desktop_raw: &str) -> Vec<PathBuf> {
    let mut tiers = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        tiers.push(config_dir.join("xdg-desktop-portal"));
    }
    tiers.push(PathBuf::from("/etc/xdg-desktop-portal"));
    tiers.push(PathBuf::from("/usr/share/xdg-desktop-portal"));

    paths_for_tiers(&tiers, desktop_raw)
}

fn paths_for_tiers(tiers: &[PathBuf], desktop_raw: &str) -> Vec<PathBuf> {
    let desktops: Vec<String> = desktop_raw
        .split(':')
        .map(|segment| segment.trim().to_lowercase())
        .filter(|segment| !segment.is_empty())
        .collect();

    let mut paths = Vec::new();
    for tier in tiers {
        for desktop in &desktops {
            paths.push(tier.join(format!("{desktop}-portals.conf")));
        }
        paths.push(tier.join("portals.conf"));
    }
    paths
}

/// Read and merge the given portals.conf candidates.
///
/// Paths are consulted in order; a key set by an earlier file is never
/// overridden by a later one. Missing or unreadable files are skipped.
pub fn read_portals_config(paths: &[PathBuf]) -> PortalsConfig {
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut sources = Vec::new();

    for path in paths {
        let Ok(content) = fs::read_to_string(path) else {
            trace!(path = %path.display(), "portals.conf candidate absent");
            continue;
        };

        let parsed = parse_portals_conf(&content);
        let mut contributed = false;
        for (key, backends) in parsed {
            if !merged.contains_key(&key) {
                merged.insert(key, backends);
                contributed = true;
            }
        }
        if contributed {
            debug!(path = %path.display(), "portals.conf contributed preferences");
            sources.push(path.clone());
        }
    }

    PortalsConfig {
        preferred: merged,
        sources,
    }
}

/// Parse the `[preferred]` section of one portals.conf.
///
/// Values are semicolon-separated backend lists; empty entries (including a
/// trailing separator) are dropped.
pub fn parse_portals_conf(content: &str) -> BTreeMap<String, Vec<String>> {
    let mut preferred = BTreeMap::new();
    let mut in_preferred = false;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            in_preferred = line[1..line.len() - 1].trim() == "preferred";
            continue;
        }
        if !in_preferred {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let backends: Vec<String> = value
                .split(';')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect();
            preferred.insert(key.trim().to_string(), backends);
        }
    }

    preferred
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preferred_section() {
        let content = "\
# system defaults
[preferred]
default=gnome;gtk;
org.freedesktop.impl.portal.ScreenCast=kde
org.freedesktop.impl.portal.Secret = gnome-keyring

[other]
default=ignored
";
        let parsed = parse_portals_conf(content);
        assert_eq!(
            parsed.get("default"),
            Some(&vec!["gnome".to_string(), "gtk".to_string()])
        );
        assert_eq!(
            parsed.get("org.freedesktop.impl.portal.ScreenCast"),
            Some(&vec!["kde".to_string()])
        );
        assert_eq!(
            parsed.get("org.freedesktop.impl.portal.Secret"),
            Some(&vec!["gnome-keyring".to_string()])
        );
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_parse_wildcard_and_none() {
        let parsed = parse_portals_conf("[preferred]\ndefault=*\norg.freedesktop.impl.portal.ScreenCast=none\n");
        assert_eq!(parsed.get("default"), Some(&vec!["*".to_string()]));
        assert_eq!(
            parsed.get("org.freedesktop.impl.portal.ScreenCast"),
            Some(&vec!["none".to_string()])
        );
    }

    #[test]
    fn test_parse_ignores_keys_outside_preferred() {
        let parsed = parse_portals_conf("default=gtk\n[preferred]\n");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_paths_for_tiers_order() {
        let tiers = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        let paths = paths_for_tiers(&tiers, "ubuntu:GNOME");
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/a/ubuntu-portals.conf"),
                PathBuf::from("/a/gnome-portals.conf"),
                PathBuf::from("/a/portals.conf"),
                PathBuf::from("/b/ubuntu-portals.conf"),
                PathBuf::from("/b/gnome-portals.conf"),
                PathBuf::from("/b/portals.conf"),
            ]
        );
    }

    #[test]
    fn test_paths_for_tiers_no_desktop() {
        let tiers = vec![PathBuf::from("/a")];
        let paths = paths_for_tiers(&tiers, "");
        assert_eq!(paths, vec![PathBuf::from("/a/portals.conf")]);
    }

    #[test]
    fn test_merge_first_wins_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user-portals.conf");
        let system = dir.path().join("system-portals.conf");
        fs::write(&user, "[preferred]\norg.freedesktop.impl.portal.ScreenCast=kde\n").unwrap();
        fs::write(&system, "[preferred]\ndefault=gtk\norg.freedesktop.impl.portal.ScreenCast=gnome\n")
            .unwrap();

        let merged = read_portals_config(&[user.clone(), system.clone()]);

        // ScreenCast from the higher-precedence file, default filled from the lower
        assert_eq!(
            merged.preferred.get("org.freedesktop.impl.portal.ScreenCast"),
            Some(&vec!["kde".to_string()])
        );
        assert_eq!(merged.preferred.get("default"), Some(&vec!["gtk".to_string()]));
        assert_eq!(merged.sources, vec![user, system]);
    }

    #[test]
    fn test_merge_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent-portals.conf");
        let present = dir.path().join("portals.conf");
        fs::write(&present, "[preferred]\ndefault=hyprland\n").unwrap();

        let merged = read_portals_config(&[missing, present.clone()]);
        assert_eq!(
            merged.preferred.get("default"),
            Some(&vec!["hyprland".to_string()])
        );
        assert_eq!(merged.sources, vec![present]);
    }
}
