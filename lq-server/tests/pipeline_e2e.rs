//! End-to-end pipeline tests: a real server and real workers over loopback
//! TCP, with generated images and millisecond heartbeats.

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lq_image::srgb_to_lab;
use lq_net::Dealer;
use lq_proto::{encode_command, Command};
use lq_server::{Server, ServerOptions};
use lq_worker::{ServerConnection, ServerDetails, WorkerError};

const TICK: Duration = Duration::from_millis(200);
const HEARTBEAT: Duration = Duration::from_millis(300);

fn test_options(output_dir: &Path) -> ServerOptions {
    ServerOptions {
        bind_host: "127.0.0.1".to_string(),
        work_port: 0,
        comm_port: 0,
        heartbeat_interval: HEARTBEAT,
        output_dir: output_dir.to_path_buf(),
        ..ServerOptions::default()
    }
}

fn write_gray_png(dir: &Path, name: &str, size: (u32, u32), value: u8) -> PathBuf {
    let path = dir.join(name);
    image::RgbImage::from_pixel(size.0, size.1, image::Rgb([value, value, value]))
        .save(&path)
        .unwrap();
    path
}

fn spawn_worker(server: &Server) -> JoinHandle<Result<(), WorkerError>> {
    let details = ServerDetails::new(
        "e2e-server",
        "127.0.0.1",
        server.work_port(),
        server.comm_port(),
    );
    thread::spawn(move || {
        let mut connection = ServerConnection::with_timeout(details, TICK);
        connection.connect()?;
        connection.run()
    })
}

fn mean_lightness(tiff_path: &Path) -> f32 {
    let decoded = image::open(tiff_path).unwrap().to_rgb8();
    let sum: f64 = decoded
        .pixels()
        .map(|pixel| srgb_to_lab(pixel.0).l as f64)
        .sum();
    (sum / (decoded.width() * decoded.height()) as f64) as f32
}

#[test]
fn empty_directory_serves_nothing() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let mut server = Server::bind(test_options(output.path())).unwrap();
    let summary = server.serve(input.path()).unwrap();

    assert_eq!(summary.images, 0);
    assert!(summary.outputs.is_empty());
}

#[test]
fn single_image_gets_an_identity_equalisation() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_gray_png(input.path(), "gray.png", (10, 10), 128);

    let mut server = Server::bind(test_options(output.path())).unwrap();
    let worker = spawn_worker(&server);

    let summary = server.serve(input.path()).unwrap();
    assert_eq!(summary.images, 1);
    assert_eq!(summary.outputs.len(), 1);
    assert_eq!(summary.outputs[0], output.path().join("gray.png.tiff"));

    // Identity mapping: the output lightness matches the input.
    let input_l = srgb_to_lab([128, 128, 128]).l;
    let output_l = mean_lightness(&summary.outputs[0]);
    assert!((output_l - input_l).abs() < 0.01);

    // After the run every worker has been dismissed and exits cleanly.
    worker.join().unwrap().unwrap();
}

#[test]
fn brightness_shift_pulls_the_second_image_toward_the_first() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_gray_png(input.path(), "a_dark.png", (12, 12), 64);
    write_gray_png(input.path(), "b_bright.png", (12, 12), 192);

    let mut server = Server::bind(test_options(output.path())).unwrap();
    let worker = spawn_worker(&server);

    let summary = server.serve(input.path()).unwrap();
    assert_eq!(summary.images, 2);
    assert_eq!(summary.outputs.len(), 2);

    let dark_l = srgb_to_lab([64, 64, 64]).l;

    // First in sort order keeps its own distribution.
    let first_out = mean_lightness(&output.path().join("a_dark.png.tiff"));
    assert!((first_out - dark_l).abs() < 0.01);

    // The brighter image is matched against the darker one's histogram.
    let second_out = mean_lightness(&output.path().join("b_bright.png.tiff"));
    assert!(
        (second_out - dark_l).abs() < 0.01,
        "expected ~{dark_l}, got {second_out}"
    );

    worker.join().unwrap().unwrap();
}

#[test]
fn several_workers_share_a_wave() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    for i in 0..12u32 {
        let value = (40 + i * 10) as u8;
        write_gray_png(input.path(), &format!("img_{i:02}.png"), (4, 4), value);
    }

    let mut server = Server::bind(test_options(output.path())).unwrap();
    let first = spawn_worker(&server);
    let second = spawn_worker(&server);

    let summary = server.serve(input.path()).unwrap();
    assert_eq!(summary.images, 12);
    assert_eq!(summary.outputs.len(), 12);
    for i in 0..12 {
        assert!(output.path().join(format!("img_{i:02}.png.tiff")).exists());
    }

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
}

/// A worker that announces itself, hoards jobs, and never answers anything:
/// the server must dismiss it on heartbeat timeout and reassign its backlog.
fn spawn_black_hole(server: &Server) -> JoinHandle<()> {
    let work_port = server.work_port();
    let comm_port = server.comm_port();
    thread::spawn(move || {
        let work = Dealer::connect(("127.0.0.1", work_port), "VOID0", TICK).unwrap();
        let control = Dealer::connect(("127.0.0.1", comm_port), "VOID0", TICK).unwrap();
        control
            .send(&encode_command(&Command::Helo { concurrency: 4 }).unwrap())
            .unwrap();

        // Swallow whatever arrives; never reply. The dealer connections are
        // held open until the server cuts them on dismissal.
        loop {
            match work.recv() {
                Ok(_) => continue,
                Err(lq_net::RecvError::Timeout) => continue,
                Err(_) => break,
            }
        }
        drop(control);
    })
}

#[test]
fn crashed_workers_jobs_are_reassigned() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    for i in 0..30u32 {
        let value = (30 + i * 5) as u8;
        write_gray_png(input.path(), &format!("img_{i:02}.png"), (2, 2), value);
    }

    let mut server = Server::bind(test_options(output.path())).unwrap();
    let black_hole = spawn_black_hole(&server);
    // Give the black hole a head start so it hoards part of wave 1.
    thread::sleep(Duration::from_millis(100));
    let survivor = spawn_worker(&server);

    let summary = server.serve(input.path()).unwrap();
    assert_eq!(summary.images, 30);
    assert_eq!(summary.outputs.len(), 30, "every job must be redone elsewhere");

    survivor.join().unwrap().unwrap();
    black_hole.join().unwrap();
}
