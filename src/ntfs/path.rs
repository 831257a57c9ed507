//! Path resolution over directory lookups.
//!
//! Paths use `\` or `/` as separators. A leading separator starts from the
//! root; otherwise resolution starts from the caller's current directory.
//! The caller passes its whole ancestry (root first), so `..` simply pops
//! one level and never needs to read the parent back from disk.

use crate::error::{NtfsError, Result};

use super::record::MftReference;

/// What the resolver needs from a directory tree.
pub trait DirectoryLookup {
    /// Reference of the entry `name` inside directory `dir`.
    fn lookup_child(&mut self, dir: MftReference, name: &str) -> Result<MftReference>;

    fn is_directory(&mut self, reference: MftReference) -> Result<bool>;
}

fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

/// Resolve `path` against `stack` (root first, current directory last).
///
/// Returns the new ancestry with the target last. Intermediate components
/// must be directories.
pub fn resolve<L: DirectoryLookup>(
    lookup: &mut L,
    stack: &[MftReference],
    path: &str,
) -> Result<Vec<MftReference>> {
    let root = *stack
        .first()
        .ok_or_else(|| NtfsError::InvalidParameter("empty path stack".into()))?;

    let start = if path.starts_with(is_separator) {
        vec![root]
    } else {
        stack.to_vec()
    };
    let components: Vec<&str> = path.split(is_separator).filter(|c| !c.is_empty()).collect();
    walk(lookup, start, &components)
}

/// Resolve an already split sequence of components from the root.
pub fn resolve_components<L: DirectoryLookup>(
    lookup: &mut L,
    root: MftReference,
    components: &[&str],
) -> Result<Vec<MftReference>> {
    walk(lookup, vec![root], components)
}

fn walk<L: DirectoryLookup>(
    lookup: &mut L,
    mut stack: Vec<MftReference>,
    components: &[&str],
) -> Result<Vec<MftReference>> {
    for (i, component) in components.iter().enumerate() {
        match *component {
            "" | "." => continue,
            ".." => {
                // The root is its own parent
                if stack.len() > 1 {
                    stack.pop();
                }
                continue;
            }
            _ => {}
        }

        let dir = *stack
            .last()
            .ok_or_else(|| NtfsError::InvalidParameter("empty path stack".into()))?;
        if !lookup.is_directory(dir)? {
            let walked = components[..i].join("\\");
            return Err(NtfsError::NotADirectory(walked));
        }
        let child = lookup.lookup_child(dir, component)?;
        stack.push(child);
    }
    Ok(stack)
}
