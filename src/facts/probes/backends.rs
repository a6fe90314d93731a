//! Portal backend discovery
//!
//! Backends are found two ways and the results stitched together by the
//! collector: `.portal` files on disk describe what is installed, and the
//! session bus name list shows what is actually alive right now.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::facts::state::{PortalBackend, BACKEND_NAME_PREFIX, PORTAL_FRONTEND_NAME};

/// Directories scanned for `.portal` files
pub fn portal_file_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/share/xdg-desktop-portal/portals"),
        PathBuf::from("/usr/local/share/xdg-desktop-portal/portals"),
    ]
}

/// Discover installed portal backends from `.portal` files.
///
/// Files are visited in sorted order per directory so discovery is
/// deterministic; the first file claiming a D-Bus name wins. The returned
/// backends have `running` and `owned_names` unset, the collector fills
/// those from live bus state.
pub fn discover_backends(dirs: &[PathBuf]) -> Vec<PortalBackend> {
    let mut backends: Vec<PortalBackend> = Vec::new();

    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            debug!(dir = %dir.display(), "portal directory absent");
            continue;
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "portal"))
            .collect();
        files.sort();

        for file in files {
            let content = match fs::read_to_string(&file) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "unreadable .portal file");
                    continue;
                }
            };
            let Some(mut backend) = parse_portal_file(&content) else {
                warn!(file = %file.display(), "malformed .portal file (no DBusName)");
                continue;
            };
            if backends.iter().any(|b| b.dbus_name == backend.dbus_name) {
                continue;
            }
            backend.portal_file = Some(file);
            backends.push(backend);
        }
    }

    debug!(count = backends.len(), "discovered portal backends");
    backends
}

/// Parse one `.portal` keyfile.
///
/// Returns `None` when the `[portal]` section has no `DBusName`, which makes
/// the file useless for identifying a backend.
pub fn parse_portal_file(content: &str) -> Option<PortalBackend> {
    let mut in_portal = false;
    let mut dbus_name: Option<String> = None;
    let mut interfaces = Vec::new();
    let mut use_in = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_portal = line[1..line.len() - 1].trim() == "portal";
            continue;
        }
        if !in_portal {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            match key.trim() {
                "DBusName" => dbus_name = Some(value.to_string()),
                "Interfaces" => interfaces = split_list(value),
                "UseIn" => use_in = split_list(value),
                _ => {}
            }
        }
    }

    let dbus_name = dbus_name?;
    Some(PortalBackend {
        name: short_backend_name(&dbus_name),
        dbus_name,
        portal_file: None,
        interfaces,
        use_in,
        running: false,
        owned_names: Vec::new(),
    })
}

/// Short backend name from its D-Bus name ("...desktop.kde" -> "kde")
fn short_backend_name(dbus_name: &str) -> String {
    dbus_name
        .rsplit('.')
        .next()
        .unwrap_or(dbus_name)
        .to_string()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Portal-related well-known names currently owned on the session bus.
///
/// Includes the frontend (`org.freedesktop.portal.Desktop`) and every
/// backend implementation name.
pub async fn owned_portal_names(connection: &zbus::Connection) -> Result<Vec<String>> {
    let proxy = zbus::fdo::DBusProxy::new(connection)
        .await
        .context("Failed to create DBus proxy")?;
    let names = proxy
        .list_names()
        .await
        .context("Failed to list session bus names")?;

    let mut owned: Vec<String> = names
        .into_iter()
        .map(|name| name.to_string())
        .filter(|name| {
            name == PORTAL_FRONTEND_NAME || name.starts_with("org.freedesktop.impl.portal.")
        })
        .collect();
    owned.sort();
    Ok(owned)
}

/// Whether `owned` marks this backend as live
pub(crate) fn backend_owned_names(dbus_name: &str, owned: &[String]) -> Vec<String> {
    owned
        .iter()
        .filter(|name| name.as_str() == dbus_name)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::state::SCREENCAST_INTERFACE;

    const KDE_PORTAL: &str = "\
[portal]
DBusName=org.freedesktop.impl.portal.desktop.kde
Interfaces=org.freedesktop.impl.portal.ScreenCast;org.freedesktop.impl.portal.Screenshot;
UseIn=kde
";

    #[test]
    fn test_parse_portal_file() {
        let backend = parse_portal_file(KDE_PORTAL).unwrap();
        assert_eq!(backend.name, "kde");
        assert_eq!(backend.dbus_name, "org.freedesktop.impl.portal.desktop.kde");
        assert_eq!(
            backend.interfaces,
            vec![
                SCREENCAST_INTERFACE.to_string(),
                "org.freedesktop.impl.portal.Screenshot".to_string()
            ]
        );
        assert_eq!(backend.use_in, vec!["kde".to_string()]);
        assert!(!backend.running);
    }

    #[test]
    fn test_parse_portal_file_requires_dbus_name() {
        assert!(parse_portal_file("[portal]\nInterfaces=a;b\n").is_none());
        assert!(parse_portal_file("DBusName=outside.section\n").is_none());
    }

    #[test]
    fn test_discover_backends_sorted_and_deduped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b-second.portal"), KDE_PORTAL).unwrap();
        fs::write(
            dir.path().join("a-first.portal"),
            "[portal]\nDBusName=org.freedesktop.impl.portal.desktop.gtk\nUseIn=gnome\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("c-duplicate.portal"),
            "[portal]\nDBusName=org.freedesktop.impl.portal.desktop.gtk\nUseIn=other\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "not a portal").unwrap();

        let backends = discover_backends(&[dir.path().to_path_buf()]);
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].name, "gtk");
        assert_eq!(backends[0].use_in, vec!["gnome".to_string()]);
        assert_eq!(backends[1].name, "kde");
        assert!(backends[0]
            .portal_file
            .as_ref()
            .is_some_and(|p| p.ends_with("a-first.portal")));
    }

    #[test]
    fn test_discover_backends_missing_dir() {
        let backends = discover_backends(&[PathBuf::from("/nonexistent/portals")]);
        assert!(backends.is_empty());
    }

    #[test]
    fn test_backend_owned_names() {
        let owned = vec![
            "org.freedesktop.impl.portal.desktop.kde".to_string(),
            "org.freedesktop.portal.Desktop".to_string(),
        ];
        assert_eq!(
            backend_owned_names("org.freedesktop.impl.portal.desktop.kde", &owned),
            vec!["org.freedesktop.impl.portal.desktop.kde".to_string()]
        );
        assert!(backend_owned_names("org.freedesktop.impl.portal.desktop.gtk", &owned).is_empty());
    }
}
