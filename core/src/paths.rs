use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

pub const MODEL_EXTENSIONS: &[&str] = &[".ckpt", ".safetensors", ".pt", ".pth", ".bin", ".gguf"];

/// Directory names that count as a conventional model location even when
/// they are not registered categories.
pub const CONVENTIONAL_DIRS: &[&str] = &["checkpoints", "loras", "vae", "clip"];

const DEFAULT_CATEGORIES: &[&str] = &[
    "checkpoints",
    "loras",
    "vae",
    "clip",
    "clip_vision",
    "controlnet",
    "embeddings",
    "upscale_models",
    "unet",
    "diffusers",
];

#[derive(Debug, Clone)]
pub struct Category {
    pub roots: Vec<PathBuf>,
    pub extensions: Vec<String>,
}

/// Maps a model category (`loras`, `checkpoints`, ...) to its ordered roots
/// and the file extensions it accepts.
#[derive(Debug, Clone, Default)]
pub struct PathRegistry {
    categories: BTreeMap<String, Category>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One root per default category under `models_root`.
    pub fn with_defaults(models_root: impl AsRef<Path>) -> Self {
        let mut registry = Self::new();
        for name in DEFAULT_CATEGORIES {
            registry.register(
                name,
                vec![models_root.as_ref().join(name)],
                MODEL_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            );
        }
        registry
    }

    pub fn register(&mut self, name: &str, roots: Vec<PathBuf>, extensions: Vec<String>) {
        let mut unique: Vec<PathBuf> = Vec::with_capacity(roots.len());
        for root in roots {
            if !unique.contains(&root) {
                unique.push(root);
            }
        }
        let extensions = extensions
            .into_iter()
            .map(|ext| normalize_extension(&ext))
            .collect();
        self.categories.insert(
            name.to_string(),
            Category {
                roots: unique,
                extensions,
            },
        );
    }

    /// Adds a root to an existing category, or creates the category with the
    /// default extension set.
    pub fn add_root(&mut self, name: &str, root: PathBuf) {
        match self.categories.get_mut(name) {
            Some(category) => {
                if !category.roots.contains(&root) {
                    category.roots.push(root);
                }
            }
            None => self.register(
                name,
                vec![root],
                MODEL_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            ),
        }
    }

    pub fn get(&self, name: &str) -> CoreResult<&Category> {
        self.categories
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("model category {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.categories.contains_key(name)
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(|name| name.as_str())
    }

    pub fn root(&self, name: &str, index: usize) -> CoreResult<&Path> {
        let category = self.get(name)?;
        category.roots.get(index).map(|p| p.as_path()).ok_or_else(|| {
            CoreError::Validation(format!("path index {} is not configured for {}", index, name))
        })
    }

    pub fn full_path(&self, name: &str, index: usize, filename: &str) -> CoreResult<PathBuf> {
        Ok(self.root(name, index)?.join(filename))
    }

    pub fn accepts(&self, name: &str, filename: &str) -> bool {
        let Ok(category) = self.get(name) else {
            return false;
        };
        match extension_of(filename) {
            Some(ext) => category.extensions.iter().any(|allowed| allowed == &ext),
            None => false,
        }
    }

    /// True when some component of `path` names a category directory.
    pub fn is_conventional_location(&self, path: &Path) -> bool {
        path.components().any(|component| {
            let name = component.as_os_str().to_string_lossy().to_ascii_lowercase();
            CONVENTIONAL_DIRS.contains(&name.as_str())
                || self.categories.keys().any(|category| category.eq_ignore_ascii_case(&name))
        })
    }
}

/// Lowercased extension including the leading dot.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}
