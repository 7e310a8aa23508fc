use comms::msg::{Command, Msg, Payload};
use tokio::io;

#[tokio::test]
async fn gradient_frame_arrives_intact() {
    let (one, two) = io::duplex(64);
    let (rx_a, tx_a) = io::split(one);
    let (rx_b, tx_b) = io::split(two);
    let (_, mut tx) = comms::channel(rx_a, tx_a);
    let (mut rx, _) = comms::channel(rx_b, tx_b);

    let grad: Vec<f32> = (0..100).map(|i| i as f32 * 0.5).collect();

    let sending = tokio::spawn(async move {
        let msg = Msg::Data(Payload::Gradient(&grad));
        tx.send(&msg).await.unwrap();
        grad
    });

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await.unwrap();
    let sent = sending.await.unwrap();

    match msg {
        Msg::Data(Payload::Gradient(g)) => assert_eq!(g, sent.as_slice()),
        other => panic!("unexpected msg: {other:?}"),
    }
    assert_eq!(rx.received(), 1);
}

#[tokio::test]
async fn frames_keep_their_order() {
    let (one, two) = io::duplex(1024);
    let (rx_a, tx_a) = io::split(one);
    let (rx_b, tx_b) = io::split(two);
    let (_, mut tx) = comms::channel(rx_a, tx_a);
    let (mut rx, _) = comms::channel(rx_b, tx_b);

    tx.send(&Msg::Control(Command::Join {
        rank: 1,
        world_size: 2,
    }))
    .await
    .unwrap();
    tx.send(&Msg::Err("boom".into())).await.unwrap();
    tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Join { rank, world_size }) => {
            assert_eq!((rank, world_size), (1, 2))
        }
        other => panic!("unexpected msg: {other:?}"),
    }
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Err(e) => assert_eq!(e, "boom"),
        other => panic!("unexpected msg: {other:?}"),
    }
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(cmd) => assert_eq!(cmd, Command::Disconnect),
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[tokio::test]
async fn closed_stream_is_an_error() {
    let (one, two) = io::duplex(64);
    drop(one);
    let (rx_b, tx_b) = io::split(two);
    let (mut rx, _) = comms::channel(rx_b, tx_b);

    let mut buf: Vec<u32> = Vec::new();
    let res: std::io::Result<Msg> = rx.recv_into(&mut buf).await;
    assert!(res.is_err());
}
