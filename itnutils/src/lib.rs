/// Diagnostics processus/ports partagés par le daemon et le CLI.
///
/// # Fonctions principales
///
/// - [`find_process_using_port`] : identifie le processus qui occupe un port
/// - [`process_alive`] : teste si un pid correspond à un processus vivant
/// - [`pidfile`] : lecture/écriture du fichier pid du daemon
mod pidfile;
mod process;

pub use pidfile::{read_pid_file, remove_pid_file, write_pid_file};
pub use process::{ProcessPortInfo, TransportProtocol, find_process_using_port, process_alive};
