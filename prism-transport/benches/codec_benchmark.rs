use criterion::{black_box, criterion_group, criterion_main, Criterion};
use prism_core::{Binary, Canvas, Command, Image, PixelFormat, Value, ValueMap};
use prism_transport::protocol::{decode_server_frame, CommandRequest};
use prism_transport::{decode_value, encode_value, ByteOrder, ImageFrame};

fn typical_params() -> Value {
    Value::map()
        .with("camera_name", "default_camera")
        .with("resolution", Value::map().with("x", 1920).with("y", 1080))
        .with("aspect", 16.0 / 9.0)
        .with("transform", (0..16).map(f64::from).collect::<Vec<_>>())
        .with("visible", true)
}

fn bench_value_encode(c: &mut Criterion) {
    let value = typical_params();
    c.bench_function("value_encode_params", |b| {
        b.iter(|| black_box(encode_value(black_box(&value), ByteOrder::Little).unwrap()))
    });
}

fn bench_value_decode(c: &mut Criterion) {
    let encoded = encode_value(&typical_params(), ByteOrder::Little).unwrap();
    c.bench_function("value_decode_params", |b| {
        b.iter(|| black_box(decode_value(black_box(&encoded), ByteOrder::Little).unwrap()))
    });
}

fn bench_command_request(c: &mut Criterion) {
    let commands: Vec<Command> = (0..32)
        .map(|i| {
            Command::new("instance_set_transform")
                .param("instance_name", format!("instance_{i}"))
                .param("transform", typical_params())
        })
        .collect();
    let request = CommandRequest {
        id: Some(7),
        commands,
        render_loop: None,
        state_params: ValueMap::new(),
    };
    c.bench_function("command_request_encode_32", |b| {
        b.iter(|| black_box(request.encode(ByteOrder::Little).unwrap()))
    });
}

fn bench_image_frame_decode(c: &mut Criterion) {
    let jpeg = ImageFrame {
        image_id: 1,
        server_time: 12.5,
        render_loop: "main".into(),
        image: Image::Encoded(Binary::new("image/jpeg", vec![0xAB; 256 * 1024])),
        statistics: ValueMap::new(),
    }
    .encode(ByteOrder::Little)
    .unwrap();
    c.bench_function("image_frame_decode_256KB", |b| {
        b.iter(|| black_box(decode_server_frame(black_box(&jpeg), ByteOrder::Little).unwrap()))
    });

    let layer = vec![0u8; Canvas::layer_len(640, 480, PixelFormat::Rgba).unwrap()];
    let canvas = Canvas::new(640, 480, PixelFormat::Rgba, vec![layer]).unwrap();
    let raw = ImageFrame {
        image_id: 2,
        server_time: 13.0,
        render_loop: "main".into(),
        image: Image::Canvas(canvas),
        statistics: ValueMap::new(),
    }
    .encode(ByteOrder::Big)
    .unwrap();
    c.bench_function("image_frame_decode_canvas_640x480", |b| {
        b.iter(|| black_box(decode_server_frame(black_box(&raw), ByteOrder::Big).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_value_encode,
    bench_value_decode,
    bench_command_request,
    bench_image_frame_decode,
);
criterion_main!(benches);
