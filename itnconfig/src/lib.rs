//! # Module de configuration d'Infinitune
//!
//! Cette crate gère la configuration de l'ensemble des processus
//! Infinitune (serveur, daemon, CLI) :
//! - Chargement depuis un fichier YAML
//! - Fusion avec la configuration par défaut embarquée
//! - Overrides par variables d'environnement
//! - Getters/setters typés pour les valeurs de configuration
//! - Accès singleton thread-safe
//!
//! ## Usage
//!
//! ```no_run
//! use itnconfig::get_config;
//!
//! let config = get_config();
//! let port = config.get_http_port();
//! config.set_http_port(9000)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::info;

// Modules conditionnels pour l'API REST
#[cfg(feature = "api")]
pub mod api;
#[cfg(feature = "api")]
pub mod openapi;

#[cfg(feature = "api")]
pub use openapi::ApiDoc;

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("infinitune.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("Failed to load Infinitune configuration"));
}

const ENV_CONFIG_DIR: &str = "INFINITUNE_CONFIG";
const ENV_PREFIX: &str = "INFINITUNE_CONFIG__";

// Default values for configuration
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_LOG_BUFFER_CAPACITY: usize = 1000;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Macro to generate getter/setter for usize values with default
#[macro_export]
macro_rules! impl_usize_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> usize {
            match self.get_value($path) {
                Ok(serde_yaml::Value::Number(n)) if n.is_i64() => n.as_i64().unwrap() as usize,
                Ok(serde_yaml::Value::Number(n)) if n.is_u64() => n.as_u64().unwrap() as usize,
                _ => $default,
            }
        }

        pub fn $setter(&self, size: usize) -> anyhow::Result<()> {
            let n = serde_yaml::Number::from(size);
            self.set_value($path, serde_yaml::Value::Number(n))
        }
    };
}

/// Macro to generate getter/setter for bool values with default
#[macro_export]
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> bool {
            match self.get_value($path) {
                Ok(serde_yaml::Value::Bool(b)) => b,
                _ => $default,
            }
        }

        pub fn $setter(&self, value: bool) -> anyhow::Result<()> {
            self.set_value($path, serde_yaml::Value::Bool(value))
        }
    };
}

/// Gestionnaire de configuration d'Infinitune
///
/// La structure charge le YAML externe, le fusionne avec les valeurs par
/// défaut embarquées, applique les overrides d'environnement et fournit
/// des accès typés. Elle est partagée entre threads via `get_config()`.
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

// Implémentation manuelle de Clone (Mutex n'est pas Clone)
impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.data.lock().unwrap().clone();
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    /// Cherche le répertoire de configuration en essayant plusieurs emplacements
    fn find_config_dir(directory: &str) -> String {
        // 1. Répertoire fourni explicitement
        if !directory.is_empty() {
            return directory.to_string();
        }

        // 2. Variable d'environnement
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
            return env_path;
        }

        // 3. Répertoire courant
        if Path::new(".infinitune").exists() {
            return ".infinitune".to_string();
        }

        // 4. Home de l'utilisateur
        if let Some(home) = home_dir() {
            let home_config = home.join(".infinitune");
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        // Fallback
        ".infinitune".to_string()
    }

    /// Valide et prépare un répertoire de configuration
    fn validate_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(anyhow!("Le chemin spécifié n'est pas un répertoire"));
        }

        // Test d'écriture
        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;

        // Test de lecture
        fs::read_dir(path)?;

        Ok(())
    }

    /// Détermine et valide le répertoire de configuration
    ///
    /// L'ordre de recherche est :
    /// 1. Le paramètre `directory` s'il n'est pas vide
    /// 2. La variable d'environnement `INFINITUNE_CONFIG`
    /// 3. `.infinitune` dans le répertoire courant
    /// 4. `.infinitune` dans le home de l'utilisateur
    ///
    /// Le répertoire est créé s'il n'existe pas.
    ///
    /// # Panics
    ///
    /// Panique si le répertoire ne peut pas être créé ou validé.
    pub fn config_dir(directory: &str) -> String {
        let dir_path = Self::find_config_dir(directory);
        let path = Path::new(&dir_path);

        Self::validate_config_dir(path)
            .expect("Impossible de valider le répertoire de configuration");

        dir_path
    }

    /// Charge la configuration depuis le répertoire indiqué
    ///
    /// 1. Détermine le répertoire de configuration
    /// 2. Charge la configuration par défaut embarquée
    /// 3. Fusionne avec le fichier config.yaml externe s'il existe
    /// 4. Applique les overrides d'environnement
    /// 5. Sauvegarde la configuration fusionnée
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory);
        info!(config_dir = %config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        // Charger la configuration par défaut
        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        // Essayer de charger le fichier de configuration
        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file = %path, "Loaded config file");
            data
        } else {
            info!(config_file = %path, "Config file not found, using default embedded config");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        // Merger avec la config par défaut
        let external_value: Value = serde_yaml::from_slice(&yaml_data)?;
        merge_yaml(&mut default_value, &external_value);
        let mut config_value = Self::lower_keys_value(default_value);

        // Appliquer les overrides d'environnement
        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    /// Sauvegarde la configuration courante dans config.yaml
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        let yaml = serde_yaml::to_string(&*data)?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Définit une valeur au chemin donné et sauvegarde
    ///
    /// # Arguments
    ///
    /// * `path` - Tableau de clés (ex: `&["host", "http_port"]`)
    /// * `value` - La valeur YAML à écrire
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        Self::set_value_internal(&mut data, path, value)?;
        drop(data);
        self.save()?;
        Ok(())
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key = path[0].to_lowercase();
            let key_value = Value::String(key);
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("Current node is not a map"))
        }
    }

    /// Récupère la valeur au chemin donné
    ///
    /// # Arguments
    ///
    /// * `path` - Tableau de clés (ex: `&["host", "http_port"]`)
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock().unwrap();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                let key = key.to_lowercase();

                if let Some(next) = map.get(&Value::String(key)) {
                    current = next;
                } else {
                    return Err(anyhow!("Path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("Path {} is not a Config", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if key.starts_with(ENV_PREFIX) {
                let key_path = key
                    .trim_start_matches(ENV_PREFIX)
                    .split("__")
                    .collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                let _ = Self::set_value_internal(config, &key_path, yaml_value);
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    if let Value::String(s) = k {
                        let new_key = Value::String(s.to_lowercase());
                        new_map.insert(new_key, Self::lower_keys_value(v));
                    } else {
                        new_map.insert(k, Self::lower_keys_value(v));
                    }
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }

    /// Résout un chemin relatif ou absolu et crée le répertoire si nécessaire
    fn resolve_and_create_dir(&self, dir_path: &str) -> Result<String> {
        let path = Path::new(dir_path);

        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            // Chemin relatif : résolu par rapport à config_dir
            Path::new(&self.config_dir).join(path)
        };

        if !absolute_path.exists() {
            fs::create_dir_all(&absolute_path)?;
            info!(directory = %absolute_path.display(), "Created managed directory");
        }

        Ok(absolute_path.to_string_lossy().to_string())
    }

    /// Récupère un répertoire géré par la configuration
    ///
    /// Le répertoire peut être absolu ou relatif au répertoire de
    /// configuration ; il est créé s'il n'existe pas, et la valeur par
    /// défaut est écrite dans le YAML si la clé est absente.
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<String> {
        let dir_path = match self.get_value(path) {
            Ok(Value::String(s)) => s,
            _ => {
                self.set_managed_dir(path, default.to_string())?;
                default.to_string()
            }
        };
        self.resolve_and_create_dir(&dir_path)
    }

    /// Définit un répertoire géré par la configuration
    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }

    /// Répertoire de configuration courant
    pub fn dir(&self) -> &str {
        &self.config_dir
    }

    /// Chemin du fichier config.yaml
    pub fn file_path(&self) -> &str {
        &self.path
    }

    /// URL de base du serveur Infinitune (utilisée par le daemon et le CLI)
    pub fn get_base_url(&self) -> String {
        match self.get_value(&["host", "base_url"]) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            Ok(_) => {
                tracing::warn!("Base URL is not a string or empty, using default");
                DEFAULT_BASE_URL.to_string()
            }
            Err(err) => {
                tracing::warn!("Failed to get base URL: {}, using default", err);
                DEFAULT_BASE_URL.to_string()
            }
        }
    }

    /// Définit l'URL de base du serveur
    pub fn set_base_url(&self, url: String) -> Result<()> {
        self.set_value(&["host", "base_url"], Value::String(url))
    }

    /// Port HTTP du serveur
    pub fn get_http_port(&self) -> u16 {
        match self.get_value(&["host", "http_port"]) {
            Ok(Value::Number(n)) if n.is_i64() => n.as_i64().unwrap() as u16,
            Ok(Value::String(s)) => match s.parse::<u16>() {
                Ok(port) => port,
                Err(_) => {
                    tracing::warn!(
                        "Invalid HTTP port '{}', using default {}",
                        s,
                        DEFAULT_HTTP_PORT
                    );
                    DEFAULT_HTTP_PORT
                }
            },
            Ok(_) => DEFAULT_HTTP_PORT,
            Err(err) => {
                tracing::warn!(
                    "Failed to get HTTP port: {}, using default {}",
                    err,
                    DEFAULT_HTTP_PORT
                );
                DEFAULT_HTTP_PORT
            }
        }
    }

    /// Définit le port HTTP du serveur
    pub fn set_http_port(&self, port: u16) -> Result<()> {
        let n = Number::from(port);
        self.set_value(&["host", "http_port"], Value::Number(n))
    }

    /// Lecture générique d'une chaîne avec défaut
    pub fn get_string_or(&self, path: &[&str], default: &str) -> String {
        match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => default.to_string(),
        }
    }

    /// Lecture générique d'un u64 avec défaut
    pub fn get_u64_or(&self, path: &[&str], default: u64) -> u64 {
        match self.get_value(path) {
            Ok(Value::Number(n)) if n.is_u64() => n.as_u64().unwrap(),
            Ok(Value::Number(n)) if n.is_i64() => n.as_i64().unwrap().max(0) as u64,
            _ => default,
        }
    }

    /// Lecture générique d'un f64 avec défaut
    pub fn get_f64_or(&self, path: &[&str], default: f64) -> f64 {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n.as_f64().unwrap_or(default),
            _ => default,
        }
    }

    /// Dernière playlist utilisée par le CLI (vide si aucune)
    pub fn get_last_playlist(&self) -> Option<String> {
        match self.get_value(&["state", "last_playlist"]) {
            Ok(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Mémorise la dernière playlist utilisée
    pub fn set_last_playlist(&self, id: &str) -> Result<()> {
        self.set_value(&["state", "last_playlist"], Value::String(id.to_string()))
    }

    /// Dernière room utilisée par le CLI (vide si aucune)
    pub fn get_last_room(&self) -> Option<String> {
        match self.get_value(&["state", "last_room"]) {
            Ok(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Mémorise la dernière room utilisée
    pub fn set_last_room(&self, id: &str) -> Result<()> {
        self.set_value(&["state", "last_room"], Value::String(id.to_string()))
    }

    /// Identifiant stable de device pour le daemon local (généré au premier accès)
    pub fn get_device_id(&self) -> Result<String> {
        let path = &["daemon", "device_id"];
        match self.get_value(path) {
            Ok(Value::String(id)) if !id.trim().is_empty() => Ok(id.trim().to_string()),
            _ => {
                let new_id = uuid::Uuid::new_v4().to_string();
                self.set_value(path, Value::String(new_id.clone()))?;
                Ok(new_id)
            }
        }
    }

    /// Répertoire runtime du daemon (socket + pid), créé si besoin
    pub fn get_runtime_dir(&self) -> Result<PathBuf> {
        let default = env::var("XDG_RUNTIME_DIR")
            .map(|d| format!("{}/infinitune", d))
            .unwrap_or_else(|_| "/tmp/infinitune".to_string());
        let dir = self.resolve_and_create_dir(&self.get_string_or(&["daemon", "runtime_dir"], &default))?;
        Ok(PathBuf::from(dir))
    }

    impl_usize_config!(
        get_log_cache_size,
        set_log_cache_size,
        &["host", "logger", "buffer_capacity"],
        DEFAULT_LOG_BUFFER_CAPACITY
    );

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Récupère le niveau de log minimum depuis la configuration
    pub fn get_log_min_level(&self) -> String {
        match self.get_value(&["host", "logger", "min_level"]) {
            Ok(Value::String(s)) => s,
            _ => DEFAULT_LOG_MIN_LEVEL.to_string(),
        }
    }

    /// Définit le niveau de log minimum
    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["host", "logger", "min_level"], Value::String(level))
    }
}

/// Retourne l'instance globale de configuration
///
/// L'instance est chargée paresseusement au premier accès.
///
/// # Examples
///
/// ```no_run
/// use itnconfig::get_config;
///
/// let config = get_config();
/// let port = config.get_http_port();
/// ```
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// Fusionne la configuration externe dans la configuration par défaut
///
/// Fusion récursive : les mappings sont fusionnés clé par clé, les
/// scalaires et séquences de la configuration externe remplacent les
/// valeurs par défaut.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(), // scalaires ou séquences : on remplace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config::load_config(dir.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn default_values_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        assert_eq!(config.get_http_port(), 8080);
        assert_eq!(config.get_u64_or(&["generation", "buffer_target"], 0), 3);
        assert_eq!(
            config.get_u64_or(&["generation", "audio_not_found_grace_secs"], 0),
            120
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        config.set_http_port(9999).unwrap();
        assert_eq!(config.get_http_port(), 9999);

        config.set_last_playlist("pl-42").unwrap();
        assert_eq!(config.get_last_playlist().as_deref(), Some("pl-42"));
    }

    #[test]
    fn nested_set_value_creates_intermediate_maps() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        config
            .set_value(&["providers", "llm", "model"], Value::String("m2".into()))
            .unwrap();
        assert_eq!(
            config.get_string_or(&["providers", "llm", "model"], ""),
            "m2"
        );
    }

    #[test]
    fn device_id_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let first = config.get_device_id().unwrap();
        let second = config.get_device_id().unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
