//! Registre des providers : résolution par nom, capacités uniformes.
//!
//! Les appelants détiennent la capacité (`Arc<dyn LlmProvider>`, etc.),
//! jamais le provider concret.

use crate::audio::AudioProvider;
use crate::error::{ProviderError, Result};
use crate::image::ImageProvider;
use crate::llm::LlmProvider;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Registre des capacités providers
#[derive(Default)]
pub struct ProviderRegistry {
    llm: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    image: RwLock<HashMap<String, Arc<dyn ImageProvider>>>,
    audio: RwLock<HashMap<String, Arc<dyn AudioProvider>>>,
    default_llm: RwLock<Option<String>>,
    default_image: RwLock<Option<String>>,
    default_audio: RwLock<Option<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un provider LLM (le premier enregistré devient le défaut)
    pub fn register_llm(&self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        info!(provider = %name, "Registering LLM provider");
        self.llm.write().unwrap().insert(name.clone(), provider);
        self.default_llm.write().unwrap().get_or_insert(name);
    }

    /// Enregistre un provider image
    pub fn register_image(&self, provider: Arc<dyn ImageProvider>) {
        let name = provider.name().to_string();
        info!(provider = %name, "Registering image provider");
        self.image.write().unwrap().insert(name.clone(), provider);
        self.default_image.write().unwrap().get_or_insert(name);
    }

    /// Enregistre un provider audio
    pub fn register_audio(&self, provider: Arc<dyn AudioProvider>) {
        let name = provider.name().to_string();
        info!(provider = %name, "Registering audio provider");
        self.audio.write().unwrap().insert(name.clone(), provider);
        self.default_audio.write().unwrap().get_or_insert(name);
    }

    /// Résout une capacité LLM par nom
    pub fn llm(&self, name: &str) -> Result<Arc<dyn LlmProvider>> {
        self.llm
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Capacité LLM par défaut
    pub fn default_llm(&self) -> Result<Arc<dyn LlmProvider>> {
        let name = self
            .default_llm
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| ProviderError::UnknownProvider("llm".to_string()))?;
        self.llm(&name)
    }

    /// Résout une capacité image par nom
    pub fn image(&self, name: &str) -> Result<Arc<dyn ImageProvider>> {
        self.image
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Capacité image par défaut
    pub fn default_image(&self) -> Result<Arc<dyn ImageProvider>> {
        let name = self
            .default_image
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| ProviderError::UnknownProvider("image".to_string()))?;
        self.image(&name)
    }

    /// Résout une capacité audio par nom
    pub fn audio(&self, name: &str) -> Result<Arc<dyn AudioProvider>> {
        self.audio
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Capacité audio par défaut
    pub fn default_audio(&self) -> Result<Arc<dyn AudioProvider>> {
        let name = self
            .default_audio
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| ProviderError::UnknownProvider("audio".to_string()))?;
        self.audio(&name)
    }

    /// Construit un registre complet depuis la configuration
    #[cfg(feature = "itnconfig")]
    pub fn from_config() -> Result<Self> {
        use crate::audio::AceAudio;
        use crate::image::HttpImage;
        use crate::llm::HttpLlm;

        let registry = Self::new();
        registry.register_llm(Arc::new(HttpLlm::from_config()?));
        registry.register_image(Arc::new(HttpImage::from_config()?));
        registry.register_audio(Arc::new(AceAudio::from_config()?));
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeImage, FakeLlm};

    #[test]
    fn first_registered_becomes_default() {
        let registry = ProviderRegistry::new();
        registry.register_llm(Arc::new(FakeLlm::returning_text("one")));
        registry.register_image(Arc::new(FakeImage::new()));

        assert_eq!(registry.default_llm().unwrap().name(), "fake-llm");
        assert!(registry.llm("unknown").is_err());
    }
}
