use std::{ sync::{ mpsc::Receiver, Arc, Mutex }, thread };

use color_eyre::Result;
use listener::Listener;
use state::TrainingState;
use ui::App;

pub mod ui;
pub mod state;
pub mod listener;

/// Runs the dashboard on the calling thread until the user quits.
///
/// States received on `rx` replace the displayed one; the dashboard keeps
/// showing the last state once the sender is dropped.
pub fn run(rx: Receiver<TrainingState>) -> Result<()> {
    let state = Arc::new(Mutex::new(TrainingState::default()));

    let listener = Listener {
        rx,
        state: Arc::clone(&state),
    };

    thread::spawn(move || {
        listener.listen_and_update();
    });

    let terminal = ratatui::init();
    let app_result = App::new(state).run(terminal);
    ratatui::restore();
    app_result
}
