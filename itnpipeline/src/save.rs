//! Sauvegarde d'un morceau généré : téléchargement, tags, durée.
//!
//! L'écriture passe par un fichier `.part` renommé en place : rejouer la
//! sauvegarde après un crash écrase simplement le fichier partiel.

use crate::error::{Error, Result};
use itnstore::Song;
use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey, Tag, TagExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pochette en mémoire (octets + format), mise en cache par le worker.
#[derive(Debug, Clone)]
pub struct CachedCover {
    pub bytes: Vec<u8>,
    pub format: String,
}

/// Résultat d'une sauvegarde.
#[derive(Debug)]
pub struct SavedAudio {
    pub path: PathBuf,
    pub duration_secs: Option<f64>,
}

/// Rapatrie l'audio produit par le provider dans le stockage local.
///
/// `source` est soit une URL http(s), soit un chemin de fichier visible
/// localement (provider co-hébergé).
pub async fn fetch_audio(
    client: &reqwest::Client,
    source: &str,
    storage_dir: &Path,
    song_id: &str,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(storage_dir)
        .await
        .map_err(|e| Error::Save(format!("cannot create storage dir: {}", e)))?;

    let ext = source
        .rsplit('.')
        .next()
        .filter(|ext| ext.len() <= 4 && !ext.contains('/'))
        .unwrap_or("mp3");
    let dest = storage_dir.join(format!("{}.{}", song_id, ext));
    let part = storage_dir.join(format!("{}.{}.part", song_id, ext));

    if source.starts_with("http://") || source.starts_with("https://") {
        let response = client
            .get(source)
            .send()
            .await
            .map_err(|e| Error::Save(format!("audio download failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Save(format!(
                "audio download failed with status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Save(format!("audio download failed: {}", e)))?;
        tokio::fs::write(&part, &bytes)
            .await
            .map_err(|e| Error::Save(format!("cannot write audio file: {}", e)))?;
    } else {
        tokio::fs::copy(source, &part)
            .await
            .map_err(|e| Error::Save(format!("cannot copy audio file: {}", e)))?;
    }

    tokio::fs::rename(&part, &dest)
        .await
        .map_err(|e| Error::Save(format!("cannot finalize audio file: {}", e)))?;

    debug!(song_id = %song_id, path = %dest.display(), "Audio saved");
    Ok(dest)
}

/// Écrit les tags (titre/artiste/album/BPM/paroles/pochette) et retourne
/// la durée lue dans le fichier.
///
/// Le tagging est best-effort : un format exotique ne fait pas échouer la
/// sauvegarde, seule la durée devient inconnue.
pub fn write_tags(
    path: &Path,
    song: &Song,
    album: &str,
    cover: Option<&CachedCover>,
) -> Result<SavedAudio> {
    let mut tagged_file = match Probe::open(path).and_then(|probe| probe.read()) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), "Cannot probe audio file for tagging: {}", e);
            return Ok(SavedAudio {
                path: path.to_path_buf(),
                duration_secs: None,
            });
        }
    };

    let duration_secs = Some(tagged_file.properties().duration().as_secs_f64());

    let tag_type = tagged_file.primary_tag_type();
    let tag = if let Some(tag) = tagged_file.tag_mut(tag_type) {
        tag
    } else {
        tagged_file.insert_tag(Tag::new(tag_type));
        tagged_file.tag_mut(tag_type).expect("Just inserted tag")
    };

    if let Some(title) = &song.metadata.title {
        tag.set_title(title.clone());
    }
    if let Some(artist) = &song.metadata.artist {
        tag.set_artist(artist.clone());
    }
    tag.set_album(album.to_string());

    if let Some(lyrics) = &song.metadata.lyrics {
        tag.insert_text(ItemKey::Lyrics, lyrics.clone());
    }
    if let Some(bpm) = song.metadata.bpm {
        tag.insert_text(ItemKey::IntegerBpm, format!("{}", bpm.round() as i64));
    }

    if let Some(cover) = cover {
        let mime = match cover.format.as_str() {
            "jpeg" | "jpg" => MimeType::Jpeg,
            "webp" => MimeType::Unknown("image/webp".to_string()),
            _ => MimeType::Png,
        };
        let picture = Picture::new_unchecked(
            PictureType::CoverFront,
            Some(mime),
            None,
            cover.bytes.clone(),
        );
        tag.push_picture(picture);
    }

    if let Err(e) = tag.save_to_path(path, WriteOptions::default()) {
        warn!(path = %path.display(), "Cannot write tags: {}", e);
    }

    Ok(SavedAudio {
        path: path.to_path_buf(),
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_audio_copies_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("generated.mp3");
        tokio::fs::write(&src, b"not really audio").await.unwrap();

        let storage = dir.path().join("songs");
        let client = reqwest::Client::new();
        let dest = fetch_audio(&client, src.to_str().unwrap(), &storage, "song-1")
            .await
            .unwrap();

        assert_eq!(dest, storage.join("song-1.mp3"));
        assert_eq!(
            tokio::fs::read(&dest).await.unwrap(),
            b"not really audio".to_vec()
        );
        // Pas de fichier partiel résiduel
        assert!(!storage.join("song-1.mp3.part").exists());
    }

    #[tokio::test]
    async fn fetch_audio_defaults_extension() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("generated");
        tokio::fs::write(&src, b"x").await.unwrap();

        let storage = dir.path().join("songs");
        let client = reqwest::Client::new();
        let dest = fetch_audio(&client, src.to_str().unwrap(), &storage, "song-2")
            .await
            .unwrap();

        assert_eq!(dest, storage.join("song-2.mp3"));
    }

    #[test]
    fn tagging_a_non_audio_file_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.mp3");
        std::fs::write(&path, b"garbage").unwrap();

        let song = crate::testing::song_fixture("song-1", 0);
        let saved = write_tags(&path, &song, "Album", None).unwrap();
        assert!(saved.duration_secs.is_none());
    }
}
