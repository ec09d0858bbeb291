//! Construction des appels LLM (structure des tâches, pas de prose).
//!
//! Les corps de prompts restent volontairement courts : la qualité
//! musicale est l'affaire des modèles, le pipeline ne garantit que la
//! structure (schémas JSON, fenêtre de dédoublonnage, plan de gestion).

use itnstore::{ManagerPlan, ManagerSlot, Playlist, RecentDescription, Song, SongMetadata};
use serde_json::{json, Value};

/// Schéma JSON des métadonnées de morceau.
pub fn metadata_schema() -> Value {
    json!({
        "type": "object",
        "required": ["title", "artist", "caption"],
        "properties": {
            "title": {"type": "string"},
            "artist": {"type": "string"},
            "lyrics": {"type": "string"},
            "caption": {"type": "string"},
            "bpm": {"type": "number"},
            "key_scale": {"type": "string"},
            "time_signature": {"type": "string"},
            "mood": {"type": "string"},
            "energy": {"type": "string"},
        }
    })
}

pub fn metadata_system() -> String {
    "You are the resident songwriter of an endless generative radio. \
     Answer with a single JSON object matching the requested schema."
        .to_string()
}

/// Prompt de génération de métadonnées : prompt de playlist (ou prompt
/// propre du morceau pour un interrupt), brief de gestion, slot du plan,
/// et fenêtre des morceaux récents à éviter.
pub fn metadata_user(
    playlist: &Playlist,
    song: &Song,
    slot: Option<&ManagerSlot>,
    recent: &[RecentDescription],
) -> String {
    let mut parts = Vec::new();

    let prompt = song
        .prompt
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or(&playlist.prompt);
    parts.push(format!("Playlist direction: {}", prompt));

    if let Some(brief) = &playlist.manager_brief {
        parts.push(format!("Operating brief: {}", brief));
    }
    if let Some(slot) = slot {
        if let Some(topic) = &slot.topic {
            parts.push(format!("Slot topic: {}", topic));
        }
        if let Some(theme) = &slot.lyrical_theme {
            parts.push(format!("Lyrical theme: {}", theme));
        }
        if let Some(energy) = &slot.energy_target {
            parts.push(format!("Energy target: {}", energy));
        }
        if let Some(transition) = &slot.transition {
            parts.push(format!("Transition from previous song: {}", transition));
        }
    }

    if !recent.is_empty() {
        let titles: Vec<String> = recent
            .iter()
            .map(|d| format!("{} by {}", d.title, d.artist))
            .collect();
        parts.push(format!(
            "Do not repeat these recent songs: {}",
            titles.join("; ")
        ));
    }

    parts.push("Write the metadata for the next song.".to_string());
    parts.join("\n")
}

/// Décode le JSON de métadonnées en tolérant les champs manquants.
pub fn parse_metadata(value: &Value) -> SongMetadata {
    SongMetadata {
        title: value["title"].as_str().map(String::from),
        artist: value["artist"].as_str().map(String::from),
        lyrics: value["lyrics"].as_str().map(String::from),
        caption: value["caption"].as_str().map(String::from),
        bpm: value["bpm"].as_f64(),
        key_scale: value["key_scale"].as_str().map(String::from),
        time_signature: value["time_signature"].as_str().map(String::from),
        audio_duration: None,
        mood: value["mood"].as_str().map(String::from),
        energy: value["energy"].as_str().map(String::from),
    }
}

/// Schéma JSON du brief de gestion.
pub fn brief_schema() -> Value {
    json!({
        "type": "object",
        "required": ["brief", "slots"],
        "properties": {
            "brief": {"type": "string"},
            "slots": {
                "type": "array",
                "minItems": 3,
                "maxItems": 8,
                "items": {
                    "type": "object",
                    "properties": {
                        "transition": {"type": "string"},
                        "topic": {"type": "string"},
                        "lyrical_theme": {"type": "string"},
                        "energy_target": {"type": "string"},
                    }
                }
            }
        }
    })
}

pub fn brief_system() -> String {
    "You are the playlist manager of a generative radio. Plan the next \
     window of songs. Answer with a single JSON object matching the schema."
        .to_string()
}

pub fn brief_user(playlist: &Playlist, start_order_index: i64) -> String {
    format!(
        "Playlist direction: {}\nPlan a window of upcoming songs starting at position {}.",
        playlist.prompt, start_order_index
    )
}

/// Décode le brief + plan retourné par le LLM.
pub fn parse_brief(value: &Value, start_order_index: i64) -> Option<(String, ManagerPlan)> {
    let brief = value["brief"].as_str()?.to_string();
    let slots: Vec<ManagerSlot> = value["slots"]
        .as_array()?
        .iter()
        .map(|slot| ManagerSlot {
            transition: slot["transition"].as_str().map(String::from),
            topic: slot["topic"].as_str().map(String::from),
            lyrical_theme: slot["lyrical_theme"].as_str().map(String::from),
            energy_target: slot["energy_target"].as_str().map(String::from),
        })
        .collect();

    if slots.is_empty() {
        return None;
    }

    let window_size = slots.len() as i64;
    Some((
        brief,
        ManagerPlan {
            start_order_index,
            window_size,
            slots,
        },
    ))
}

pub fn persona_system() -> String {
    "Extract a short persona description of the fictional artist behind this song. \
     Two sentences, plain text."
        .to_string()
}

pub fn persona_user(song: &Song) -> String {
    format!(
        "Artist: {}\nTitle: {}\nCaption: {}",
        song.metadata.artist.as_deref().unwrap_or("unknown"),
        song.metadata.title.as_deref().unwrap_or("untitled"),
        song.metadata.caption.as_deref().unwrap_or(""),
    )
}

/// Payload de soumission audio construit depuis les métadonnées.
pub fn audio_payload(song: &Song) -> Value {
    json!({
        "caption": song.metadata.caption,
        "lyrics": song.metadata.lyrics,
        "bpm": song.metadata.bpm,
        "key_scale": song.metadata.key_scale,
        "time_signature": song.metadata.time_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_metadata_tolerates_missing_fields() {
        let value = json!({"title": "Neon Rain", "artist": "Static Veil"});
        let metadata = parse_metadata(&value);
        assert_eq!(metadata.title.as_deref(), Some("Neon Rain"));
        assert!(metadata.lyrics.is_none());
        assert!(metadata.bpm.is_none());
    }

    #[test]
    fn parse_brief_requires_slots() {
        assert!(parse_brief(&json!({"brief": "x", "slots": []}), 0).is_none());

        let (brief, plan) = parse_brief(
            &json!({"brief": "late night", "slots": [{"topic": "a"}, {"topic": "b"}, {}]}),
            7,
        )
        .unwrap();
        assert_eq!(brief, "late night");
        assert_eq!(plan.start_order_index, 7);
        assert_eq!(plan.window_size, 3);
    }
}
