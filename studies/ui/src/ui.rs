use ratatui::{
    buffer::Buffer,
    layout::{ Alignment, Constraint, Direction, Layout, Rect },
    style::{ palette::tailwind, Color, Style },
    symbols,
    text::Text,
    widgets::{
        block::Title,
        Axis,
        Block,
        Borders,
        Cell,
        Chart,
        Dataset,
        Gauge,
        GraphType,
        LineGauge,
        Padding,
        Paragraph,
        Row,
        Table,
        Widget,
    },
    DefaultTerminal,
};
use std::{ rc::Rc, time::Duration };
use crossterm::event::{ self, Event, KeyCode, KeyEventKind };
use color_eyre::Result;
use ratatui::prelude::Stylize;

use crate::state::{ StateMutex, TrainingState };

const CUSTOM_LABEL_COLOR: Color = tailwind::SLATE.c200;

#[derive(Debug)]
pub struct App {
    pub state: AppState,
    pub training: StateMutex,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    #[default]
    Running,
    Quitting,
}

impl App {
    pub fn new(training: StateMutex) -> Self {
        App { state: AppState::Running, training }
    }

    pub fn run(mut self, mut terminal: DefaultTerminal) -> Result<()> {
        while self.state != AppState::Quitting {
            terminal.draw(|frame| frame.render_widget(&self, frame.area()))?;
            self.handle_events()?;
        }
        Ok(())
    }

    fn handle_events(&mut self) -> Result<()> {
        let timeout = Duration::from_secs_f32(1.0 / 20.0);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => self.quit(),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn quit(&mut self) {
        self.state = AppState::Quitting;
    }

    fn snapshot(&self) -> TrainingState {
        match self.training.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Widget for &App {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let state = self.snapshot();

        let body = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([Constraint::Max(1), Constraint::Fill(2), Constraint::Max(1)].as_ref())
            .split(area);

        let container = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([Constraint::Length(7), Constraint::Fill(1)].as_ref())
            .split(body[1]);

        let section_progress = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Fill(1)].as_ref())
            .split(container[0]);

        let section_info = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Length(60), Constraint::Fill(1)].as_ref())
            .split(container[1]);

        let section_info_table = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)].as_ref())
            .split(section_info[0]);

        let section_axis = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
            .split(section_info[1]);

        render_header(&state, body[0], buf);
        render_footer(&state, body[2], buf);
        render_progress(&state, section_progress, buf);
        render_charts(&state, section_axis, buf);
        render_table_summary(&state, section_info_table[0], buf);
        render_table_history(&state, section_info_table[1], buf);
    }
}

fn render_header(state: &TrainingState, area: Rect, buf: &mut Buffer) {
    let best = state.best_score.map_or_else(|| "-".to_string(), |score| format!("{score:.4}"));
    Paragraph::new(format!("Training nodule segmentation {}  best score {}", state.run_name, best))
        .bold()
        .alignment(Alignment::Left)
        .fg(CUSTOM_LABEL_COLOR)
        .render(area, buf);
}

fn render_footer(state: &TrainingState, area: Rect, buf: &mut Buffer) {
    let text = if state.finished { "Training finished, press q to quit" } else { "Press q to quit" };
    Paragraph::new(text)
        .alignment(Alignment::Center)
        .fg(CUSTOM_LABEL_COLOR)
        .bold()
        .render(area, buf);
}

fn ratio(current: usize, max: usize) -> f64 {
    if max == 0 { 0.0 } else { ((current as f64) / (max as f64)).clamp(0.0, 1.0) }
}

fn render_progress(state: &TrainingState, area: Rc<[Rect]>, buf: &mut Buffer) {
    let progress = &state.progress;

    LineGauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("Epoch {} of {}", progress.current_epoch, progress.max_epoch))
        )
        .filled_style(Style::default().fg(Color::Cyan))
        .ratio(ratio(progress.current_epoch, progress.max_epoch))
        .render(area[0], buf);

    Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(
                    format!(
                        "{} batches of size {}: {}/{}",
                        progress.mode,
                        progress.batch_size,
                        progress.current_batch,
                        progress.max_batch
                    )
                )
        )
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio(progress.current_batch, progress.max_batch))
        .render(area[1], buf);
}

fn render_charts(state: &TrainingState, area: Rc<[Rect]>, buf: &mut Buffer) {
    let max_step = state.max_step();

    render_chart(area[0], buf, "Loss", max_step, &state.train.loss, &state.validation.loss);
    render_chart(area[1], buf, "F1 score", max_step, &state.train.f1_score, &state.validation.f1_score);
}

fn render_chart(
    area: Rect,
    buf: &mut Buffer,
    title: &str,
    max_step: f64,
    train: &[(f64, f64)],
    validation: &[(f64, f64)]
) {
    let train_dataset = Dataset::default()
        .name("trn")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .graph_type(GraphType::Line)
        .data(train);

    let validation_dataset = Dataset::default()
        .name("tst")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Yellow))
        .graph_type(GraphType::Line)
        .data(validation);

    Chart::new(vec![train_dataset, validation_dataset])
        .block(Block::default().borders(Borders::ALL).title(title.to_string()))
        .x_axis(
            Axis::default()
                .title("Samples")
                .bounds([0.0, max_step])
                .style(Style::default().fg(Color::Gray))
        )
        .y_axis(
            Axis::default()
                .title("Value")
                .bounds([0.0, 1.0])
                .style(Style::default().fg(Color::Gray))
        )
        .render(area, buf);
}

fn render_table_summary(state: &TrainingState, area: Rect, buf: &mut Buffer) {
    let header = Row::new(vec![Cell::from(Text::raw("Metric")), Cell::from(Text::raw("Value"))]).height(1);

    let rows = state.summary.iter().map(|(metric, value)| {
        Row::new(vec![Cell::from(metric.clone()), Cell::from(value.clone())]).height(1)
    });

    Table::new(rows, [Constraint::Percentage(60), Constraint::Percentage(40)])
        .header(header)
        .block(title_block("Latest metrics"))
        .render(area, buf);
}

fn render_table_history(state: &TrainingState, area: Rect, buf: &mut Buffer) {
    let rows = state.history
        .iter()
        .rev()
        .map(|(info, score)| {
            Row::new(vec![Cell::from(info.clone()), Cell::from(score.clone())]).height(1)
        });

    let header = Row::new(vec![Cell::from("Info"), Cell::from("Score")]).height(1);

    Table::new(rows, [Constraint::Percentage(70), Constraint::Percentage(30)])
        .header(header)
        .block(title_block("History"))
        .render(area, buf);
}

fn title_block(title: &str) -> Block<'_> {
    let title = Title::from(title).alignment(Alignment::Center);
    Block::new()
        .padding(Padding::vertical(1))
        .title(title)
        .borders(Borders::ALL)
        .fg(CUSTOM_LABEL_COLOR)
}
