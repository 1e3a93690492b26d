//! Benchmarks for USB/IP message encoding
//!
//! Measures encoding/decoding of:
//! - Request headers
//! - Import replies
//! - Device list replies of increasing size

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    DevListReply, DeviceDescriptor, DeviceInfo, DeviceSpeed, ImportReply, InterfaceDescriptor,
    OpCode, OpCommon, decode_from_slice, encode_to_vec,
};

fn make_device(i: u32) -> DeviceInfo {
    DeviceInfo {
        descriptor: DeviceDescriptor {
            path: format!("/sys/devices/pci0000:00/0000:00:14.0/usb1/1-{i}"),
            bus_id: format!("1-{i}"),
            busnum: 1,
            devnum: i,
            speed: DeviceSpeed::High,
            id_vendor: 0x1234,
            id_product: 0x5678,
            bcd_device: 0x0100,
            b_device_class: 0,
            b_device_sub_class: 0,
            b_device_protocol: 0,
            b_configuration_value: 1,
            b_num_configurations: 1,
            b_num_interfaces: 2,
        },
        interfaces: vec![
            InterfaceDescriptor {
                class: 0x08,
                sub_class: 0x06,
                protocol: 0x50,
            },
            InterfaceDescriptor {
                class: 0x03,
                sub_class: 0x01,
                protocol: 0x02,
            },
        ],
    }
}

fn benchmark_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("op_common");

    let header = OpCommon::request(OpCode::ReqDevList);
    group.bench_function("encode", |b| b.iter(|| encode_to_vec(black_box(&header))));

    let bytes = encode_to_vec(&header).unwrap();
    group.bench_function("decode", |b| {
        b.iter(|| decode_from_slice::<OpCommon>(black_box(&bytes)))
    });

    group.finish();
}

fn benchmark_import_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("import_reply");

    let reply = ImportReply::ok(make_device(1).descriptor);
    group.bench_function("encode", |b| b.iter(|| encode_to_vec(black_box(&reply))));

    let bytes = encode_to_vec(&reply).unwrap();
    group.bench_function("decode", |b| {
        b.iter(|| decode_from_slice::<ImportReply>(black_box(&bytes)))
    });

    group.finish();
}

fn benchmark_device_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("device_list");

    for count in [1u32, 16, 128] {
        let reply = DevListReply::new((1..=count).map(make_device).collect());
        let bytes = encode_to_vec(&reply).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &reply, |b, reply| {
            b.iter(|| encode_to_vec(black_box(reply)))
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &bytes, |b, bytes| {
            b.iter(|| decode_from_slice::<DevListReply>(black_box(bytes)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_header,
    benchmark_import_reply,
    benchmark_device_list
);
criterion_main!(benches);
