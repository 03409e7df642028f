//! Round-trip and boundary tests for the tunnel codec.

use burrow::codec::{
    self, MaskReader, MaskWriter, Utf8PackWriter, Utf8UnpackReader, TUNNEL_MASK,
};
use rand::{Rng, RngCore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SIZES: [usize; 13] = [0, 1, 2, 10, 256, 1023, 1024, 1025, 1535, 1536, 1537, 2048, 9999];

fn data_ascending(n: usize, min: u8, max: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    let mut x = min;
    for _ in 0..n {
        out.push(x);
        x = if x >= max { min } else { x + 1 };
    }
    out
}

fn data_descending(n: usize, min: u8, max: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    let mut x = max;
    for _ in 0..n {
        out.push(x);
        x = if x <= min { max } else { x - 1 };
    }
    out
}

fn data_random(n: usize, min: u8, max: u8) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut out);
    for b in &mut out {
        if *b < min || *b > max {
            *b = rand::thread_rng().gen_range(min..=max);
        }
    }
    out
}

fn generators() -> Vec<(&'static str, fn(usize, u8, u8) -> Vec<u8>)> {
    vec![
        ("ascending", data_ascending),
        ("descending", data_descending),
        ("random", data_random),
    ]
}

async fn utf8_round_trip(data: Vec<u8>, label: String) {
    let (near, far) = tokio::io::duplex(512);
    let (_unused_rx, near_wr) = tokio::io::split(near);
    let (far_rd, _unused_tx) = tokio::io::split(far);

    let expected = data.clone();
    let writer = tokio::spawn(async move {
        let mut packer = Utf8PackWriter::new(near_wr);
        packer.write_all(&data).await.unwrap();
        packer.shutdown().await.unwrap();
    });

    let mut unpacker = Utf8UnpackReader::new(far_rd);
    let mut decoded = Vec::new();
    unpacker.read_to_end(&mut decoded).await.unwrap();
    writer.await.unwrap();

    assert_eq!(decoded, expected, "{}", label);
}

async fn mask_round_trip(data: Vec<u8>, label: String) {
    let (near, far) = tokio::io::duplex(512);
    let (_unused_rx, near_wr) = tokio::io::split(near);
    let (far_rd, _unused_tx) = tokio::io::split(far);

    let expected = data.clone();
    let writer = tokio::spawn(async move {
        let mut masked = MaskWriter::new(near_wr, TUNNEL_MASK);
        masked.write_all(&data).await.unwrap();
        masked.shutdown().await.unwrap();
    });

    let mut unmasked = MaskReader::new(far_rd, TUNNEL_MASK);
    let mut decoded = Vec::new();
    unmasked.read_to_end(&mut decoded).await.unwrap();
    writer.await.unwrap();

    assert_eq!(decoded, expected, "{}", label);
}

#[tokio::test]
async fn utf8_pack_round_trips_full_byte_range() {
    for (name, gen) in generators() {
        for size in SIZES {
            utf8_round_trip(gen(size, 0x00, 0xFF), format!("{}[{}]", name, size)).await;
        }
    }
}

#[tokio::test]
async fn utf8_pack_round_trips_high_bytes_only() {
    for (name, gen) in generators() {
        for size in SIZES {
            utf8_round_trip(gen(size, 0x80, 0xFF), format!("high {}[{}]", name, size)).await;
        }
    }
}

#[tokio::test]
async fn mask_round_trips_all_sizes() {
    for (name, gen) in generators() {
        for size in SIZES {
            mask_round_trip(gen(size, 0x00, 0xFF), format!("{}[{}]", name, size)).await;
        }
    }
}

#[test]
fn mask_is_its_own_inverse() {
    let data = data_random(4096, 0x00, 0xFF);
    let once: Vec<u8> = data.iter().map(|b| b ^ 0x2A).collect();
    let twice: Vec<u8> = once.iter().map(|b| b ^ 0x2A).collect();
    assert_eq!(twice, data);
}

/// The packed stream must be valid UTF-8 no matter what goes in, including
/// trailing bytes in the surrogate-high range.
#[tokio::test]
async fn packed_output_is_valid_utf8() {
    let mut cases: Vec<Vec<u8>> = vec![
        vec![0xD8],
        vec![0xDF],
        vec![0x41, 0xDB],
        vec![0xD8, 0x00],
        data_random(1537, 0x00, 0xFF),
    ];
    for i in 0xD8..=0xDFu8 {
        cases.push(vec![i]);
    }

    for case in cases {
        let (near, far) = tokio::io::duplex(512);
        let (_unused_rx, near_wr) = tokio::io::split(near);
        let (mut far_rd, _unused_tx) = tokio::io::split(far);

        let input = case.clone();
        let writer = tokio::spawn(async move {
            let mut packer = Utf8PackWriter::new(near_wr);
            packer.write_all(&input).await.unwrap();
            packer.shutdown().await.unwrap();
        });

        let mut wire = Vec::new();
        far_rd.read_to_end(&mut wire).await.unwrap();
        writer.await.unwrap();

        assert!(
            std::str::from_utf8(&wire).is_ok(),
            "input {:02x?} produced invalid UTF-8: {:02x?}",
            case,
            wire
        );
    }
}

/// A scalar in 0x100..0x8000 cannot come from our packer; the decoder must
/// refuse it rather than guess.
#[tokio::test]
async fn unpacker_rejects_forbidden_scalars() {
    // U+0800 in UTF-8: E0 A0 80.
    let (near, far) = tokio::io::duplex(64);
    let (_unused_rx, mut near_wr) = tokio::io::split(near);
    let (far_rd, _unused_tx) = tokio::io::split(far);

    near_wr.write_all(&[0xE0, 0xA0, 0x80]).await.unwrap();
    near_wr.shutdown().await.unwrap();

    let mut unpacker = Utf8UnpackReader::new(far_rd);
    let mut decoded = Vec::new();
    let err = unpacker.read_to_end(&mut decoded).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

/// Multi-byte scalars split across tiny caller buffers exercise the residue
/// path.
#[tokio::test]
async fn unpacker_handles_one_byte_reads() {
    let data = data_random(777, 0x00, 0xFF);
    let (near, far) = tokio::io::duplex(512);
    let (_unused_rx, near_wr) = tokio::io::split(near);
    let (far_rd, _unused_tx) = tokio::io::split(far);

    let input = data.clone();
    let writer = tokio::spawn(async move {
        let mut packer = Utf8PackWriter::new(near_wr);
        packer.write_all(&input).await.unwrap();
        packer.shutdown().await.unwrap();
    });

    let mut unpacker = Utf8UnpackReader::new(far_rd);
    let mut decoded = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match unpacker.read(&mut byte).await.unwrap() {
            0 => break,
            n => decoded.extend_from_slice(&byte[..n]),
        }
    }
    writer.await.unwrap();
    assert_eq!(decoded, data);
}

/// The paired stream wrappers must cancel each other out in both directions,
/// with and without the text packing layer.
#[tokio::test]
async fn client_and_server_streams_pair_up() {
    for text in [false, true] {
        let (client_io, server_io) = tokio::io::duplex(512);
        let mut client = codec::client_stream(codec::boxed(client_io), TUNNEL_MASK, text);
        let mut server = codec::server_stream(codec::boxed(server_io), TUNNEL_MASK, text);

        let c2s = data_random(3000, 0x00, 0xFF);
        let s2c = data_random(3000, 0x00, 0xFF);

        let c2s_copy = c2s.clone();
        let s2c_copy = s2c.clone();
        let server_task = tokio::spawn(async move {
            let mut got = vec![0u8; c2s_copy.len()];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(got, c2s_copy);
            server.write_all(&s2c_copy).await.unwrap();
            server.flush().await.unwrap();
            server.shutdown().await.unwrap();
        });

        client.write_all(&c2s).await.unwrap();
        client.flush().await.unwrap();
        let mut got = vec![0u8; s2c.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, s2c, "text={}", text);
        server_task.await.unwrap();
    }
}

/// The masked wire bytes must differ from the payload (that is the point),
/// while the unmasked direction passes through untouched in binary mode.
#[tokio::test]
async fn server_writes_are_masked_on_the_wire() {
    let (server_io, mut wire) = tokio::io::duplex(512);
    let mut server = codec::server_stream(codec::boxed(server_io), TUNNEL_MASK, false);

    let payload = b"GET / HTTP/1.1\r\n\r\n";
    server.write_all(payload).await.unwrap();
    server.flush().await.unwrap();

    let mut seen = vec![0u8; payload.len()];
    wire.read_exact(&mut seen).await.unwrap();
    let unmasked: Vec<u8> = seen.iter().map(|b| b ^ TUNNEL_MASK).collect();
    assert_ne!(seen.as_slice(), payload.as_slice());
    assert_eq!(unmasked.as_slice(), payload.as_slice());
}
