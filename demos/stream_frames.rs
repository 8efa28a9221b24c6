use std::path::{Path, PathBuf};

use zarr3_sink::prelude::*;

fn shard_files(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            shard_files(&path, out);
        } else if path.file_name() != Some(std::ffi::OsStr::new("zarr.json")) {
            out.push(path);
        }
    }
}

fn main() {
    let tmp = tempdir::TempDir::new("zarr3-sink-demo").unwrap();
    let root = tmp.path().join("acquisition.zarr");

    let dims = vec![
        Dimension::new("t", DimensionKind::Time, 32, 8, 2).unwrap(),
        Dimension::new("c", DimensionKind::Channel, 1, 1, 1).unwrap(),
        Dimension::new("y", DimensionKind::Space, 240, 60, 2).unwrap(),
        Dimension::new("x", DimensionKind::Space, 320, 80, 2).unwrap(),
    ];
    let settings = StreamSettings::new(root.clone(), dims, SampleType::UInt16)
        .sample_spacing_um([0.65, 0.65])
        .external_metadata(serde_json::json!({ "instrument": "simulated" }));

    let mut session = ArraySession::open(settings).unwrap();

    let (height, width) = session.dims().frame_shape();
    let frame_numel = (height * width) as usize;
    for t in 0..32u16 {
        let mut frame = Vec::with_capacity(frame_numel * 2);
        for i in 0..frame_numel {
            let sample = t.wrapping_mul(257).wrapping_add(i as u16);
            frame.extend_from_slice(&sample.to_le_bytes());
        }
        session.append(&frame).unwrap();
    }
    session.finalize().unwrap();

    println!("wrote {} frames to {}", session.frames_appended(), root.display());
    let mut shards = Vec::new();
    shard_files(&root.join("0"), &mut shards);
    shards.sort();
    for path in shards {
        let nbytes = std::fs::metadata(&path).unwrap().len();
        println!(
            "  {} ({nbytes} bytes)",
            path.strip_prefix(&root).unwrap().display()
        );
    }
}
