//! Shannon entropy over fixed-size windows of a file.
//!
//! Carved unknown chunks (and whole files that produced no chunks) get a
//! windowed entropy profile, logged and optionally rendered as a terminal
//! scatter plot at high verbosity. High entropy hints at compressed or
//! encrypted content worth a manual look.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

const ENTROPY_WINDOW_COUNT: u64 = 80;
const ENTROPY_MIN_WINDOW: u64 = 1024;
const ENTROPY_MAX_WINDOW: u64 = 1024 * 1024;

const PLOT_WIDTH: usize = 80;
const PLOT_HEIGHT: usize = 16;

/// Shannon entropy of the byte distribution, in bits per byte (0 to 8).
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for byte in data {
        counts[*byte as usize] += 1;
    }
    let len = data.len() as f64;
    let mut entropy = 0.0;
    for count in counts {
        if count == 0 {
            continue;
        }
        let p = count as f64 / len;
        entropy -= p * p.log2();
    }
    entropy
}

/// Split the file into roughly `ENTROPY_WINDOW_COUNT` even windows, clamped
/// so tiny files are not oversampled and huge files stay fast.
pub fn calculate_window_size(file_size: u64) -> u64 {
    (file_size / ENTROPY_WINDOW_COUNT).clamp(ENTROPY_MIN_WINDOW, ENTROPY_MAX_WINDOW)
}

/// Per-window entropy of `path`, normalized to percentages of the 8-bit
/// maximum. Logged; rendered as a plot when `draw_plot` is set.
pub fn calculate_entropy(
    path: &Path,
    draw_plot: bool,
    cancel: &AtomicBool,
) -> std::io::Result<()> {
    let file_size = path.metadata()?.len();
    if file_size == 0 {
        return Ok(());
    }
    debug!(
        "calculating entropy path={} size={}",
        path.display(),
        file_size
    );

    let window_size = calculate_window_size(file_size) as usize;
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; window_size];
    let mut percentages = Vec::new();

    loop {
        if cancel.load(Ordering::Relaxed) {
            debug!("cancellation requested during entropy calculation");
            return Ok(());
        }
        let n = read_window(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        let entropy = shannon_entropy(&buf[..n]);
        percentages.push(round2(entropy / 8.0 * 100.0));
    }

    if percentages.is_empty() {
        return Ok(());
    }
    let mean = percentages.iter().sum::<f64>() / percentages.len() as f64;
    let highest = percentages.iter().cloned().fold(f64::MIN, f64::max);
    let lowest = percentages.iter().cloned().fold(f64::MAX, f64::min);
    debug!(
        "entropy calculated path={} mean={} highest={} lowest={}",
        path.display(),
        round2(mean),
        highest,
        lowest
    );

    if draw_plot {
        debug!("entropy distribution\n{}", render_plot(&percentages));
    }
    Ok(())
}

fn read_window(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 80x16 terminal scatter plot, y axis 0-100%.
fn render_plot(percentages: &[f64]) -> String {
    let width = percentages.len().min(PLOT_WIDTH);
    let mut grid = vec![vec![b' '; width]; PLOT_HEIGHT];

    for col in 0..width {
        // Downsample when there are more windows than columns.
        let idx = col * percentages.len() / width;
        let pct = percentages[idx].clamp(0.0, 100.0);
        let row = ((100.0 - pct) / 100.0 * (PLOT_HEIGHT - 1) as f64).round() as usize;
        grid[row.min(PLOT_HEIGHT - 1)][col] = b'*';
    }

    let mut out = String::new();
    for (row, cells) in grid.iter().enumerate() {
        let pct = 100.0 - row as f64 * 100.0 / (PLOT_HEIGHT - 1) as f64;
        let tick = (pct / 10.0).round() * 10.0;
        out.push_str(&format!("{tick:>4.0} |"));
        out.push_str(std::str::from_utf8(cells).unwrap_or(""));
        out.push('\n');
    }
    out.push_str("     +");
    out.push_str(&"-".repeat(width));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn entropy_extremes() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[0u8; 4096]), 0.0);

        // Uniform distribution over all byte values hits the 8-bit maximum.
        let uniform: Vec<u8> = (0..=255u8).cycle().take(256 * 16).collect();
        assert!((shannon_entropy(&uniform) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn two_symbol_alphabet_is_one_bit() {
        let data: Vec<u8> = [0u8, 255u8].iter().cycle().take(1024).cloned().collect();
        assert!((shannon_entropy(&data) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn window_size_is_clamped() {
        assert_eq!(calculate_window_size(0), ENTROPY_MIN_WINDOW);
        assert_eq!(calculate_window_size(100), ENTROPY_MIN_WINDOW);
        assert_eq!(calculate_window_size(80 * 4096), 4096);
        assert_eq!(calculate_window_size(u64::MAX / 2), ENTROPY_MAX_WINDOW);
    }

    #[test]
    fn calculate_entropy_handles_small_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[0u8; 100]).unwrap();
        drop(f);

        let cancel = AtomicBool::new(false);
        calculate_entropy(&path, true, &cancel).unwrap();
    }

    #[test]
    fn plot_renders_fixed_height() {
        let percentages = vec![0.0, 25.0, 50.0, 75.0, 100.0];
        let plot = render_plot(&percentages);
        assert_eq!(plot.lines().count(), PLOT_HEIGHT + 1);
        assert!(plot.lines().next().unwrap().starts_with(" 100 |"));
    }
}
