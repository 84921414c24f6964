use k9::assert_equal;
use natrelay_proto::frame::{encode_frame, DecodeError, Frame, MAX_FRAME_LEN, TYPE_RECORD};
use natrelay_proto::handshake::{HandshakeError, Initiator, Responder, MAX_RECORD_PLAINTEXT};
use natrelay_proto::Keypair;

fn split(encoded: &[u8]) -> Frame {
    let header: [u8; 4] = encoded[..4].try_into().unwrap();
    let len = Frame::body_len(header).unwrap();
    assert_equal!(len, encoded.len() - 4);
    Frame::from_body(encoded[4..].to_vec()).unwrap()
}

#[test]
fn handshake_survives_encoding() {
    let keypair = Keypair::from_seed(b"seed");
    let mut initiator = Initiator::new(&keypair.public_key()).unwrap();

    let hello = split(&initiator.hello().unwrap().encode_to_vec());
    let (reply, listener) = Responder::new(&keypair).unwrap().respond(&hello).unwrap();
    let dialer = initiator
        .finish(&split(&reply.encode_to_vec()))
        .unwrap();

    let (mut tx, _) = dialer.split();
    let (_, mut rx) = listener.split();
    let record = split(&tx.seal(b"{\"id\":1}\n").unwrap().encode_to_vec());
    assert_equal!(rx.open(&record).unwrap(), b"{\"id\":1}\n".to_vec());
}

#[test]
fn largest_record_fits_in_a_frame() {
    let keypair = Keypair::from_seed(b"seed");
    let mut initiator = Initiator::new(&keypair.public_key()).unwrap();
    let (reply, _) = Responder::new(&keypair)
        .unwrap()
        .respond(&initiator.hello().unwrap())
        .unwrap();
    let (mut tx, _) = initiator.finish(&reply).unwrap().split();

    let encoded = tx
        .seal(&vec![b' '; MAX_RECORD_PLAINTEXT])
        .unwrap()
        .encode_to_vec();
    assert!(encoded.len() - 4 <= MAX_FRAME_LEN as usize);
    split(&encoded);
}

#[test]
fn header_rejects_length_too_large() {
    assert_equal!(
        Frame::body_len((MAX_FRAME_LEN + 1).to_le_bytes()),
        Err(DecodeError::LengthTooLarge(MAX_FRAME_LEN + 1))
    );
}

#[test]
fn header_rejects_zero_length() {
    assert_equal!(
        Frame::body_len(0u32.to_le_bytes()),
        Err(DecodeError::InvalidLength(0))
    );
}

#[test]
fn garbage_hello_is_rejected() {
    let keypair = Keypair::from_seed(b"seed");
    let frame = split(&encode_frame(1, &[7u8; 48]));
    assert!(matches!(
        Responder::new(&keypair).unwrap().respond(&frame),
        Err(HandshakeError::Noise(_))
    ));

    let record = split(&encode_frame(TYPE_RECORD, &[0u8; 32]));
    assert!(matches!(
        Responder::new(&keypair).unwrap().respond(&record),
        Err(HandshakeError::Decode(DecodeError::UnexpectedType { .. }))
    ));
}
