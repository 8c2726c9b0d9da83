use std::sync::mpsc::Receiver;

use crate::state::{ StateMutex, TrainingState };

/// Copies every state the trainer publishes into the shared dashboard state.
pub struct Listener {
    pub rx: Receiver<TrainingState>,
    pub state: StateMutex,
}

impl Listener {
    /// Returns once the sending side hangs up.
    pub fn listen_and_update(&self) {
        while let Ok(received_state) = self.rx.recv() {
            match self.state.lock() {
                Ok(mut state) => {
                    *state = received_state;
                }
                Err(poisoned) => {
                    *poisoned.into_inner() = received_state;
                }
            }
        }

        if let Ok(mut state) = self.state.lock() {
            state.finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{ mpsc, Arc, Mutex };

    #[test]
    fn keeps_the_latest_state_and_marks_the_end() {
        let (tx, rx) = mpsc::channel();
        let state = Arc::new(Mutex::new(TrainingState::default()));
        let listener = Listener { rx, state: Arc::clone(&state) };

        for epoch in 1..=3 {
            let mut update = TrainingState::default();
            update.progress.current_epoch = epoch;
            tx.send(update).unwrap();
        }
        drop(tx);
        listener.listen_and_update();

        let state = state.lock().unwrap();
        assert_eq!(state.progress.current_epoch, 3);
        assert!(state.finished);
    }
}
