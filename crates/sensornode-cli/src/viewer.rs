use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, Paragraph};
use ratatui::Terminal;
use sensornode_core::sensor::{SensorKind, SensorSnapshot, SensorSource};
use sensornode_core::transport::MessageTransport;
use sensornode_core::{Agent, ConnectivityState};

const METRIC_KEYS: [(SensorKind, &str, Color); 6] = [
    (SensorKind::Temperature, "Temperature (C)", Color::Red),
    (SensorKind::Humidity, "Humidity (%)", Color::Cyan),
    (SensorKind::Light, "Light (%)", Color::Yellow),
    (SensorKind::Potentiometer, "Potentiometer (%)", Color::Magenta),
    (SensorKind::WifiSignal, "WiFi RSSI (dBm)", Color::Blue),
    (SensorKind::Battery, "Battery (%)", Color::Green),
];

struct MetricSeries {
    label: &'static str,
    color: Color,
    points: VecDeque<(f64, f64)>,
}

impl MetricSeries {
    fn new(label: &'static str, color: Color) -> Self {
        Self {
            label,
            color,
            points: VecDeque::new(),
        }
    }

    fn push(&mut self, x: f64, y: f64, window_sec: f64) {
        self.points.push_back((x, y));
        while self
            .points
            .front()
            .is_some_and(|(old_x, _)| x - old_x > window_sec)
        {
            self.points.pop_front();
        }
    }

    /// Y-axis range padded around the data; a flat series still gets a
    /// visible band.
    fn bounds(&self) -> [f64; 2] {
        let (min, max) = self
            .points
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), (_, y)| {
                (lo.min(*y), hi.max(*y))
            });
        if self.points.is_empty() {
            [0.0, 1.0]
        } else if (max - min).abs() < f64::EPSILON {
            [min - 1.0, max + 1.0]
        } else {
            let pad = (max - min) * 0.12;
            [min - pad, max + pad]
        }
    }
}

struct ViewerState {
    start: Instant,
    latest: Option<SensorSnapshot>,
    link: ConnectivityState,
    series: Vec<MetricSeries>,
}

impl ViewerState {
    fn new() -> Self {
        let series = METRIC_KEYS
            .iter()
            .map(|(_, label, color)| MetricSeries::new(label, *color))
            .collect();

        Self {
            start: Instant::now(),
            latest: None,
            link: ConnectivityState::Disconnected,
            series,
        }
    }

    fn update(&mut self, snapshot: Option<&SensorSnapshot>, link: ConnectivityState, window_sec: f64) {
        self.link = link;
        let Some(snapshot) = snapshot else {
            return;
        };
        let t = self.start.elapsed().as_secs_f64();
        for (idx, (kind, _, _)) in METRIC_KEYS.iter().enumerate() {
            if let Some(value) = snapshot.readings.get(kind).and_then(|r| r.value) {
                self.series[idx].push(t, value, window_sec);
            }
        }
        self.latest = Some(snapshot.clone());
    }
}

pub async fn run_viewer<S: SensorSource, T: MessageTransport>(
    agent: &mut Agent<S, T>,
    tick_interval: Duration,
    window_sec: f64,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = ViewerState::new();
    let mut next_tick = Instant::now();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.code == KeyCode::Char('q') {
                        break;
                    }
                }
            }

            if Instant::now() >= next_tick {
                agent.tick(Instant::now()).await;
                state.update(agent.bank().last_snapshot(), agent.state(), window_sec);
                next_tick = Instant::now() + tick_interval;
            }

            terminal.draw(|frame| draw_ui(frame.size(), frame, &state, window_sec))?;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw_ui(area: Rect, frame: &mut ratatui::Frame<'_>, state: &ViewerState, window_sec: f64) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let header = render_header(state, window_sec);
    frame.render_widget(header, rows[0]);

    let chart_rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(34),
            Constraint::Percentage(33),
            Constraint::Percentage(33),
        ])
        .split(rows[1]);

    let mut idx = 0;
    for row_area in chart_rows.iter().copied() {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(row_area);

        for col in cols.iter().copied() {
            if idx < state.series.len() {
                render_metric_chart(
                    frame,
                    col,
                    &state.series[idx],
                    state.start.elapsed().as_secs_f64(),
                    window_sec,
                );
            } else {
                let empty = Paragraph::new(Line::from(" "));
                frame.render_widget(empty, col);
            }
            idx += 1;
        }
    }
}

fn render_header(state: &ViewerState, window_sec: f64) -> Paragraph<'static> {
    let mut lines = Vec::new();
    if let Some(snapshot) = &state.latest {
        let valid = snapshot.readings.values().filter(|r| r.valid).count();
        let status = format!(
            "link={} sensors={}/{} gps={}",
            state.link.as_str(),
            valid,
            snapshot.readings.len(),
            snapshot
                .gps
                .as_ref()
                .map(|fix| if fix.valid { "fix" } else { "searching" })
                .unwrap_or("none"),
        );
        let detail = format!(
            "last read {}  window={}s  (press 'q' to quit)",
            snapshot.taken_at.format("%H:%M:%S"),
            window_sec as u64
        );
        lines.push(Line::from(vec![
            Span::styled(
                "Sensor Node Viewer  ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
            Span::raw(status),
        ]));
        lines.push(Line::from(detail));
    } else {
        lines.push(Line::from("Waiting first read cycle..."));
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Status"))
}

fn axis_labels(bounds: [f64; 2], precision: usize) -> Vec<Span<'static>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::raw(format!("{v:.precision$}")))
        .collect()
}

fn render_metric_chart(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    series: &MetricSeries,
    now_sec: f64,
    window_sec: f64,
) {
    let points: Vec<(f64, f64)> = series.points.iter().copied().collect();
    let x_bounds = [(now_sec - window_sec).max(0.0), now_sec.max(window_sec)];
    let y_bounds = series.bounds();

    let dataset = Dataset::default()
        .name(series.label)
        .marker(symbols::Marker::Braille)
        .graph_type(ratatui::widgets::GraphType::Line)
        .style(Style::default().fg(series.color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(series.label))
        .x_axis(
            Axis::default()
                .title("time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds(x_bounds)
                .labels(axis_labels(x_bounds, 0)),
        )
        .y_axis(
            Axis::default()
                .title("value")
                .style(Style::default().fg(Color::Gray))
                .bounds(y_bounds)
                .labels(axis_labels(y_bounds, 1)),
        );

    frame.render_widget(chart, area);
}
