use std::fs;
use std::io;
use std::path::Path;

/// Lit le pid contenu dans un fichier pid.
///
/// Retourne `None` si le fichier est absent ou illisible ; un contenu
/// non numérique est traité comme un fichier corrompu et ignoré.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok()
}

/// Écrit le pid du processus courant dans le fichier pid.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    fs::write(path, std::process::id().to_string())
}

/// Supprime le fichier pid (absence tolérée).
pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path), Some(std::process::id()));

        remove_pid_file(&path);
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn corrupt_pid_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }
}
