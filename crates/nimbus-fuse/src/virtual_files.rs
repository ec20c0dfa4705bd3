//! In-memory virtual files.
//!
//! A small set of files served entirely from memory at the mount
//! root, never stored remotely: the freedesktop volume hint and an
//! autorun stub, so file managers show a sensible volume name without
//! ever triggering hydration. The overlay policy decides what happens
//! when a real remote item carries the same name.

use nimbus_core::config::OverlayPolicy;

/// Inode numbers reserved for virtual files start here (below the
/// dynamic range of the inode table).
const VIRTUAL_INO_BASE: u64 = 2;

/// One virtual file.
#[derive(Debug, Clone)]
pub struct VirtualFile {
    /// Fixed inode number.
    pub ino: u64,
    /// Name at the mount root.
    pub name: &'static str,
    /// Static content.
    pub content: &'static [u8],
}

/// The virtual file table.
pub struct VirtualFiles {
    files: Vec<VirtualFile>,
    policy: OverlayPolicy,
}

const XDG_VOLUME_INFO: &[u8] = b"[Volume Info]\nName=NimbusFS\nIconName=folder-remote\n";
const AUTORUN_INF: &[u8] = b"[Autorun]\nLabel=NimbusFS\n";

impl VirtualFiles {
    /// The standard table.
    #[must_use]
    pub fn new(policy: OverlayPolicy) -> Self {
        Self {
            files: vec![
                VirtualFile {
                    ino: VIRTUAL_INO_BASE,
                    name: ".xdg-volume-info",
                    content: XDG_VOLUME_INFO,
                },
                VirtualFile {
                    ino: VIRTUAL_INO_BASE + 1,
                    name: "autorun.inf",
                    content: AUTORUN_INF,
                },
            ],
            policy,
        }
    }

    /// Look up by name at the root. `real_exists` tells us whether a
    /// real item shadows the name; the overlay policy arbitrates.
    #[must_use]
    pub fn lookup(&self, name: &str, real_exists: bool) -> Option<&VirtualFile> {
        let file = self.files.iter().find(|f| f.name == name)?;
        match self.policy {
            OverlayPolicy::LocalWins if real_exists => None,
            OverlayPolicy::LocalWins => Some(file),
            // The virtual file wins on lookup/open either way.
            OverlayPolicy::RemoteWins | OverlayPolicy::Merged => Some(file),
        }
    }

    /// Look up by inode number.
    #[must_use]
    pub fn by_ino(&self, ino: u64) -> Option<&VirtualFile> {
        self.files.iter().find(|f| f.ino == ino)
    }

    /// True if `ino` belongs to a virtual file.
    #[must_use]
    pub fn is_virtual_ino(&self, ino: u64) -> bool {
        self.by_ino(ino).is_some()
    }

    /// Entries to add to a root readdir. With `LocalWins` a real name
    /// suppresses the virtual entry; `shadowed` names come from the
    /// caller's store listing.
    pub fn readdir_entries<'a>(
        &'a self,
        shadowed: &'a [String],
    ) -> impl Iterator<Item = &'a VirtualFile> {
        self.files.iter().filter(move |f| {
            !(self.policy == OverlayPolicy::LocalWins
                && shadowed.iter().any(|s| s.eq_ignore_ascii_case(f.name)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_unshadowed() {
        let virtuals = VirtualFiles::new(OverlayPolicy::LocalWins);
        assert!(virtuals.lookup(".xdg-volume-info", false).is_some());
        assert!(virtuals.lookup("autorun.inf", false).is_some());
        assert!(virtuals.lookup("doc.txt", false).is_none());
    }

    #[test]
    fn test_local_wins_shadowing() {
        let virtuals = VirtualFiles::new(OverlayPolicy::LocalWins);
        assert!(virtuals.lookup(".xdg-volume-info", true).is_none());

        let virtuals = VirtualFiles::new(OverlayPolicy::RemoteWins);
        assert!(virtuals.lookup(".xdg-volume-info", true).is_some());
    }

    #[test]
    fn test_by_ino_roundtrip() {
        let virtuals = VirtualFiles::new(OverlayPolicy::LocalWins);
        let file = virtuals.lookup("autorun.inf", false).unwrap();
        assert!(virtuals.is_virtual_ino(file.ino));
        assert_eq!(virtuals.by_ino(file.ino).unwrap().name, "autorun.inf");
    }

    #[test]
    fn test_readdir_shadow_filter() {
        let virtuals = VirtualFiles::new(OverlayPolicy::LocalWins);
        let shadowed = vec!["AUTORUN.INF".to_string()];
        let names: Vec<&str> = virtuals.readdir_entries(&shadowed).map(|f| f.name).collect();
        assert_eq!(names, vec![".xdg-volume-info"]);

        let merged = VirtualFiles::new(OverlayPolicy::Merged);
        assert_eq!(merged.readdir_entries(&shadowed).count(), 2);
    }
}
