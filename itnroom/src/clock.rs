//! Estimation de l'offset d'horloge client ↔ serveur.
//!
//! À chaque `pong`, le client calcule
//! `offset = serverTime - clientTime - roundTrip/2` et garde la médiane
//! d'une petite fenêtre d'échantillons : après quelques échanges, la
//! dérive apparente converge vers la gigue réseau.

use std::collections::VecDeque;

/// Fenêtre d'échantillons d'offset (millisecondes).
#[derive(Debug, Default)]
pub struct ClockSync {
    samples: VecDeque<i64>,
    capacity: usize,
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: 9,
        }
    }

    /// Intègre un échange ping/pong.
    ///
    /// * `client_time` - instant d'émission du ping (horloge client, ms)
    /// * `server_time` - instant serveur porté par le pong (ms)
    /// * `received_at` - instant de réception du pong (horloge client, ms)
    pub fn add_sample(&mut self, client_time: i64, server_time: i64, received_at: i64) {
        let round_trip = (received_at - client_time).max(0);
        let offset = server_time - client_time - round_trip / 2;

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(offset);
    }

    /// Offset estimé (médiane), 0 tant qu'aucun échantillon.
    pub fn offset_ms(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<i64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    /// Nombre d'échantillons intégrés.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Convertit un instant serveur en instant local.
    pub fn server_to_local(&self, server_time_ms: i64) -> i64 {
        server_time_ms - self.offset_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_converges_with_symmetric_latency() {
        let mut sync = ClockSync::new();
        // Serveur en avance de 500 ms, aller-retour 80 ms symétrique.
        for i in 0..5 {
            let client_send = 1000 + i * 1000;
            let server_time = client_send + 500 + 40; // reçu au serveur après 40 ms
            let received = client_send + 80;
            sync.add_sample(client_send, server_time, received);
        }

        assert_eq!(sync.offset_ms(), 500);
        assert_eq!(sync.sample_count(), 5);
    }

    #[test]
    fn median_absorbs_jitter_spikes() {
        let mut sync = ClockSync::new();
        sync.add_sample(0, 500, 0);
        sync.add_sample(0, 500, 0);
        sync.add_sample(0, 2000, 0); // pic aberrant
        sync.add_sample(0, 500, 0);
        sync.add_sample(0, 500, 0);

        assert_eq!(sync.offset_ms(), 500);
    }

    #[test]
    fn scheduling_uses_offset() {
        let mut sync = ClockSync::new();
        sync.add_sample(0, 300, 0);

        // startAt serveur 10_000 → instant local 9_700.
        assert_eq!(sync.server_to_local(10_000), 9_700);
    }
}
