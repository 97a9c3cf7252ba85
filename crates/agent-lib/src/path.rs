//! Mapping of in-container paths to host-visible paths

use crate::error::{CriError, Result};
use crate::models::{Container, MountPoint};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Symlink redirections followed before giving up
pub const MAX_SYMLINK_DEPTH: usize = 3;

/// Lexically normalize an absolute path (`.`, `..`, duplicate separators)
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(p) => parts.push(p.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// `path` equals `prefix` or lies below it
pub fn has_path_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn join_host(base: &str, rest: &str) -> String {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rest)
    }
}

/// Mount whose destination encloses `path`; mounts are kept longest destination first
pub fn find_mount<'a>(mounts: &'a [MountPoint], path: &str) -> Option<&'a MountPoint> {
    mounts
        .iter()
        .find(|m| has_path_prefix(path, &m.destination))
}

fn translate_once(container: &Container, path: &str) -> Result<String> {
    if let Some(mount) = find_mount(&container.mounts, path) {
        let rest = &path[mount.destination.trim_end_matches('/').len()..];
        return Ok(join_host(&mount.source, rest));
    }
    if !container.merged_dir.is_empty() {
        return Ok(join_host(&container.merged_dir, path));
    }
    Err(CriError::InvalidMergedDir(container.short_id.clone()))
}

/// Translate an in-container absolute path into a host path
///
/// With `respect_symlinks`, a symlink found at the translated location is
/// resolved in the container's view and translated again, up to
/// [`MAX_SYMLINK_DEPTH`] times.
pub fn translate(container: &Container, path: &str, respect_symlinks: bool) -> Result<PathBuf> {
    let mut current = clean(path);
    let mut host = translate_once(container, &current)?;
    if !respect_symlinks {
        return Ok(PathBuf::from(host));
    }

    let mut redirects = 0;
    loop {
        let target = match fs::symlink_metadata(&host) {
            Ok(meta) if meta.file_type().is_symlink() => fs::read_link(&host)?,
            _ => return Ok(PathBuf::from(host)),
        };
        if redirects == MAX_SYMLINK_DEPTH {
            return Err(CriError::TooManySymlinks(path.to_string()));
        }
        redirects += 1;

        let target = target.to_string_lossy();
        current = if target.starts_with('/') {
            clean(&target)
        } else {
            let parent = Path::new(&current)
                .parent()
                .and_then(Path::to_str)
                .unwrap_or("/");
            clean(&format!("{parent}/{target}"))
        };
        host = translate_once(container, &current)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ContainerBuilder;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_clean() {
        assert_eq!(clean("/a//b/./c/../d"), "/a/b/d");
        assert_eq!(clean("/../.."), "/");
        assert_eq!(clean("/"), "/");
    }

    #[test]
    fn test_has_path_prefix_respects_boundaries() {
        assert!(has_path_prefix("/data/logs", "/data"));
        assert!(has_path_prefix("/data", "/data/"));
        assert!(!has_path_prefix("/database", "/data"));
        assert!(has_path_prefix("/anything", "/"));
    }

    #[test]
    fn test_mount_wins_over_merged_dir() {
        let c = ContainerBuilder::new("c1")
            .merged_dir("/hostfs/overlay/merged")
            .mount("/hostfs/volumes/logs", "/home/admin/logs", true)
            .build();

        assert_eq!(
            translate(&c, "/home/admin/logs/app.log", false).unwrap(),
            PathBuf::from("/hostfs/volumes/logs/app.log")
        );
        assert_eq!(
            translate(&c, "/etc/hosts", false).unwrap(),
            PathBuf::from("/hostfs/overlay/merged/etc/hosts")
        );
        assert_eq!(
            translate(&c, "/home/admin/logsx", false).unwrap(),
            PathBuf::from("/hostfs/overlay/merged/home/admin/logsx")
        );
    }

    #[test]
    fn test_most_specific_mount_first() {
        let c = ContainerBuilder::new("c1")
            .mount("/hostfs/a", "/data", true)
            .mount("/hostfs/b/logs-volume", "/data/logs", true)
            .build();

        assert_eq!(
            translate(&c, "/data/logs/x", false).unwrap(),
            PathBuf::from("/hostfs/b/logs-volume/x")
        );
        assert_eq!(
            translate(&c, "/data/y", false).unwrap(),
            PathBuf::from("/hostfs/a/y")
        );
    }

    #[test]
    fn test_no_merged_dir_no_mount_fails() {
        let c = ContainerBuilder::new("c1")
            .mount("/hostfs/a", "/data", true)
            .build();

        let err = translate(&c, "/etc/hosts", false).unwrap_err();
        assert!(matches!(err, CriError::InvalidMergedDir(_)));
    }

    #[test]
    fn test_mount_order_follows_destination_not_source() {
        let c = ContainerBuilder::new("c1")
            .mount("/hostfs/very/long/source/path/for/data", "/data", true)
            .mount("/hostfs/b", "/data/logs", true)
            .build();

        assert_eq!(
            translate(&c, "/data/logs/x", false).unwrap(),
            PathBuf::from("/hostfs/b/x")
        );
        assert_eq!(
            translate(&c, "/data/y", false).unwrap(),
            PathBuf::from("/hostfs/very/long/source/path/for/data/y")
        );
    }

    #[test]
    fn test_container_path_under_mount_source_is_still_translated() {
        // With hostfs at `/`, mount sources are plain host paths
        let c = ContainerBuilder::new("c1")
            .merged_dir("/var/lib/docker/overlay2/abc/merged")
            .mount("/tmp", "/host-tmp", true)
            .build();

        assert_eq!(
            translate(&c, "/tmp/foo", false).unwrap(),
            PathBuf::from("/var/lib/docker/overlay2/abc/merged/tmp/foo")
        );
        assert_eq!(
            translate(&c, "/host-tmp/foo", false).unwrap(),
            PathBuf::from("/tmp/foo")
        );
    }

    fn chain(root: &Path, links: usize) -> ContainerBuilder {
        // /l0 -> /l1 -> ... -> /l{links} (a regular file)
        for i in 0..links {
            symlink(format!("/l{}", i + 1), root.join(format!("l{i}"))).unwrap();
        }
        fs::write(root.join(format!("l{links}")), "end").unwrap();
        ContainerBuilder::new("c1").merged_dir(root.to_str().unwrap())
    }

    #[test]
    fn test_three_symlinks_resolve() {
        let root = TempDir::new().unwrap();
        let c = chain(root.path(), 3).build();

        let host = translate(&c, "/l0", true).unwrap();
        assert_eq!(host, root.path().join("l3"));
        assert_eq!(fs::read_to_string(host).unwrap(), "end");
    }

    #[test]
    fn test_four_symlinks_fail() {
        let root = TempDir::new().unwrap();
        let c = chain(root.path(), 4).build();

        let err = translate(&c, "/l0", true).unwrap_err();
        assert!(matches!(err, CriError::TooManySymlinks(_)));
    }

    #[test]
    fn test_relative_symlink_resolves_in_container_view() {
        let root = TempDir::new().unwrap();
        let vol = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("app/conf")).unwrap();
        fs::write(vol.path().join("real.yaml"), "k: v").unwrap();
        // /app/conf/current -> ../../data/real.yaml, where /data is a mount
        symlink("../../data/real.yaml", root.path().join("app/conf/current")).unwrap();

        let c = ContainerBuilder::new("c1")
            .merged_dir(root.path().to_str().unwrap())
            .mount(vol.path().to_str().unwrap(), "/data", true)
            .build();

        let host = translate(&c, "/app/conf/current", true).unwrap();
        assert_eq!(host, vol.path().join("real.yaml"));
        assert_eq!(
            translate(&c, "/app/conf/current", false).unwrap(),
            root.path().join("app/conf/current")
        );
    }
}
