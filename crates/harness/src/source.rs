use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Where fixture scripts come from.
pub trait FixtureSource {
    /// File names in the order they should run.
    fn list(&self) -> io::Result<Vec<String>>;

    fn read(&self, name: &str) -> io::Result<String>;
}

/// The `*.js` files directly inside a directory, sorted by name.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FixtureSource for DirectorySource {
    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".js") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.root.join(name))
    }
}

#[test]
fn test_directory_source() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("relu.https.any.js"), "const t = [];").unwrap();
    fs::write(dir.path().join("add.https.any.js"), "const u = [];").unwrap();
    fs::write(dir.path().join("README.md"), "docs").unwrap();
    fs::create_dir(dir.path().join("resources.js")).unwrap();

    let source = DirectorySource::new(dir.path());
    assert_eq!(
        source.list().unwrap(),
        vec!["add.https.any.js".to_string(), "relu.https.any.js".to_string()]
    );
    assert_eq!(source.read("add.https.any.js").unwrap(), "const u = [];");
    assert!(source.read("missing.js").is_err());
    assert!(DirectorySource::new(dir.path().join("nope")).list().is_err());
}
