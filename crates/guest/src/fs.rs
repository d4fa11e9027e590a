use std::collections::BTreeMap;

use crate::module::ModuleError;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// Flat in-memory filesystem keyed by normalized absolute path.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    nodes: BTreeMap<String, Node>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::Dir);
        Self { nodes }
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, ModuleError> {
        let path = normalize(path);
        match self.nodes.get(&path) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir) => Err(ModuleError::IsADirectory(path)),
            None => Err(ModuleError::NotFound(path)),
        }
    }

    pub fn write(&mut self, path: &str, content: &[u8]) -> Result<(), ModuleError> {
        let path = normalize(path);
        self.require_parent_dir(&path)?;
        if let Some(Node::Dir) = self.nodes.get(&path) {
            return Err(ModuleError::IsADirectory(path));
        }
        self.nodes.insert(path, Node::File(content.to_vec()));
        Ok(())
    }

    /// Creates one directory level. The parent must already exist.
    pub fn mkdir(&mut self, path: &str) -> Result<(), ModuleError> {
        let path = normalize(path);
        if self.nodes.contains_key(&path) {
            return Err(ModuleError::AlreadyExists(path));
        }
        self.require_parent_dir(&path)?;
        self.nodes.insert(path, Node::Dir);
        Ok(())
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(&normalize(path)), Some(Node::Dir))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalize(path))
    }

    /// Direct children of a directory, by name.
    pub fn list(&self, path: &str) -> Result<Vec<String>, ModuleError> {
        let path = normalize(path);
        if !self.is_dir(&path) {
            return Err(ModuleError::NotADirectory(path));
        }
        let prefix = if path == "/" {
            path.clone()
        } else {
            format!("{path}/")
        };
        Ok(self
            .nodes
            .keys()
            .filter_map(|candidate| candidate.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_owned)
            .collect())
    }

    fn require_parent_dir(&self, path: &str) -> Result<(), ModuleError> {
        let parent = parent_of(path);
        match self.nodes.get(parent) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(ModuleError::NotADirectory(parent.to_owned())),
            None => Err(ModuleError::NotFound(parent.to_owned())),
        }
    }
}

pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots_and_slashes() {
        assert_eq!(normalize("a//b/./c/../d"), "/a/b/d");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/.."), "/");
    }

    #[test]
    fn write_requires_existing_parent() {
        let mut fs = MemoryFs::new();
        assert_eq!(
            fs.write("/missing/file.txt", b"x"),
            Err(ModuleError::NotFound("/missing".to_owned()))
        );
        fs.mkdir("/missing").unwrap();
        fs.write("/missing/file.txt", b"x").unwrap();
        assert_eq!(fs.read("/missing/file.txt").unwrap(), b"x");
    }

    #[test]
    fn mkdir_twice_reports_existing() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/data").unwrap();
        assert_eq!(
            fs.mkdir("/data/"),
            Err(ModuleError::AlreadyExists("/data".to_owned()))
        );
    }

    #[test]
    fn list_returns_direct_children_only() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/srv").unwrap();
        fs.mkdir("/srv/www").unwrap();
        fs.write("/srv/www/index.html", b"<html>").unwrap();
        fs.write("/srv/notes", b"n").unwrap();
        assert_eq!(fs.list("/srv").unwrap(), vec!["notes", "www"]);
        assert_eq!(fs.list("/").unwrap(), vec!["srv"]);
    }
}
