//! Font discovery and loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use fontdb::{Database, Family, Query, Weight, ID};
use fontdue::{Font, FontSettings};
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Resolves family names to loaded fonts.
///
/// The font database is built once on first use; loaded faces are cached
/// and shared between overlay workers.
pub struct FontBook {
    font_dirs: Vec<PathBuf>,
    system_fonts: bool,
    default_family: String,
    db: OnceLock<Database>,
    cache: Mutex<HashMap<(String, bool), Arc<Font>>>,
}

impl FontBook {
    /// Search `font_dir` first, then the installed system fonts.
    pub fn new(font_dir: Option<&Path>, default_family: impl Into<String>) -> Self {
        Self {
            system_fonts: true,
            ..Self::with_dirs(font_dir.map(Path::to_path_buf).into_iter().collect(), default_family)
        }
    }

    /// Search only the given directories.
    pub fn with_dirs(font_dirs: Vec<PathBuf>, default_family: impl Into<String>) -> Self {
        Self {
            font_dirs,
            system_fonts: false,
            default_family: default_family.into(),
            db: OnceLock::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn database(&self) -> &Database {
        self.db.get_or_init(|| {
            let mut db = Database::new();
            // Faces loaded first win ties, so explicit directories go before the system
            for dir in &self.font_dirs {
                db.load_fonts_dir(dir);
            }
            if self.system_fonts {
                db.load_system_fonts();
            }
            debug!(faces = db.len(), "Loaded font database");
            db
        })
    }

    /// Resolve a family, falling back to the default family, the generic
    /// sans-serif family and then to any installed face. The bold face
    /// falls back to the nearest weight of the same family.
    pub fn resolve(&self, family: &str, bold: bool) -> MediaResult<Arc<Font>> {
        let key = (normalize(family), bold);
        if let Some(font) = self.lock_cache().get(&key) {
            return Ok(Arc::clone(font));
        }

        let db = self.database();
        let id = self
            .find(family, bold)
            .or_else(|| {
                debug!(family, "Font family not found, using default family");
                self.find(&self.default_family, bold)
            })
            .or_else(|| db.query(&query(&[Family::SansSerif], bold)))
            .or_else(|| {
                let any = db.faces().next();
                if let Some(face) = any {
                    warn!(family, fallback = %face.post_script_name, "Default font family not found");
                }
                any.map(|face| face.id)
            })
            .ok_or_else(|| {
                MediaError::invalid_input(format!(
                    "No usable font found for family '{}' among {} faces",
                    family,
                    db.len()
                ))
            })?;

        let font = Arc::new(self.load(id)?);
        self.lock_cache().insert(key, Arc::clone(&font));
        Ok(font)
    }

    /// Whether any font face is available.
    pub fn has_fonts(&self) -> bool {
        !self.database().is_empty()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<(String, bool), Arc<Font>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Face for a family by name. "DejaVu Sans" and "dejavusans" match the
    /// same family.
    fn find(&self, family: &str, bold: bool) -> Option<ID> {
        let name = self.family_name(family)?;
        self.database().query(&query(&[Family::Name(&name)], bold))
    }

    /// The installed spelling of `family`.
    fn family_name(&self, family: &str) -> Option<String> {
        let wanted = normalize(family);
        if wanted.is_empty() {
            return None;
        }
        self.database()
            .faces()
            .flat_map(|face| face.families.iter())
            .map(|(name, _)| name)
            .find(|name| normalize(name) == wanted)
            .cloned()
    }

    fn load(&self, id: ID) -> MediaResult<Font> {
        let db = self.database();
        let name = db
            .face(id)
            .map(|face| face.post_script_name.clone())
            .unwrap_or_default();
        db.with_face_data(id, |data, index| {
            let settings = FontSettings {
                collection_index: index,
                ..FontSettings::default()
            };
            Font::from_bytes(data, settings)
        })
        .ok_or_else(|| MediaError::font(format!("font data for {} is no longer readable", name)))?
        .map_err(|e| MediaError::font(format!("failed to parse {}: {}", name, e)))
    }
}

impl std::fmt::Debug for FontBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontBook")
            .field("font_dirs", &self.font_dirs)
            .field("system_fonts", &self.system_fonts)
            .field("default_family", &self.default_family)
            .finish()
    }
}

fn query<'a>(families: &'a [Family<'a>], bold: bool) -> Query<'a> {
    Query {
        families,
        weight: if bold { Weight::BOLD } else { Weight::NORMAL },
        ..Query::default()
    }
}

/// Lowercase alphanumerics only: "DejaVu Sans" and "DejaVuSans" compare equal.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bytes and family name of an installed face at `index` in its file.
    fn installed_face(collection: bool) -> Option<(String, Vec<u8>)> {
        let book = FontBook::new(None, "none");
        let db = book.database();
        let face = db.faces().find(|face| {
            (face.index > 0) == collection
                && face
                    .families
                    .first()
                    .is_some_and(|(name, _)| !normalize(name).is_empty())
        })?;
        let data = db.with_face_data(face.id, |data, _| data.to_vec())?;
        Some((face.families[0].0.clone(), data))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("DejaVu Sans"), "dejavusans");
        assert_eq!(normalize("DejaVuSans-Bold"), "dejavusansbold");
    }

    #[test]
    fn test_family_found_regardless_of_file_name() {
        let Some((family, data)) = installed_face(false) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f0001.ttf"), data).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not a font").unwrap();
        let book = FontBook::with_dirs(vec![dir.path().to_path_buf()], "none");

        assert!(book.has_fonts());
        assert!(book.find(&family, false).is_some());
        assert!(book.find(&family.to_uppercase().replace(' ', ""), false).is_some());
        assert!(book.find("Missing Family", false).is_none());
        assert!(book.resolve(&family, true).is_ok());
        // Unknown families fall back to the only installed face
        assert!(book.resolve("Missing Family", false).is_ok());
    }

    #[test]
    fn test_collection_faces_resolve() {
        let Some((family, data)) = installed_face(true) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("collection.ttc"), data).unwrap();
        let book = FontBook::with_dirs(vec![dir.path().to_path_buf()], "none");

        assert!(book.find(&family, false).is_some());
        assert!(book.resolve(&family, false).is_ok());
    }

    #[test]
    fn test_no_fonts_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let book = FontBook::with_dirs(vec![dir.path().to_path_buf()], "Nothing");
        assert!(!book.has_fonts());
        assert!(matches!(
            book.resolve("Nothing", false),
            Err(MediaError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_corrupt_font_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Broken.ttf"), b"not a font").unwrap();
        let book = FontBook::with_dirs(vec![dir.path().to_path_buf()], "Broken");
        assert!(!book.has_fonts());
        assert!(matches!(
            book.resolve("Broken", false),
            Err(MediaError::InvalidInput(_))
        ));
    }
}
