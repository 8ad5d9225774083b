use super::*;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn event() -> ServerEvent {
    ServerEvent::CallEnded {}
}

fn connect(hub: &Hub) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn_id = ConnectionId::new();
    hub.register(conn_id, tx);
    (conn_id, rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> usize {
    let mut n = 0;
    while rx.try_recv().is_ok() {
        n += 1;
    }
    n
}

#[test]
fn room_delivery_reaches_every_member() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(&hub);
    let (b, mut rx_b) = connect(&hub);
    let (_c, mut rx_c) = connect(&hub);
    hub.join("room", a);
    hub.join("room", b);

    hub.send_to_room("room", &event());
    assert_eq!(drain(&mut rx_a), 1);
    assert_eq!(drain(&mut rx_b), 1);
    assert_eq!(drain(&mut rx_c), 0);
}

#[test]
fn except_sender_skips_exactly_one_connection() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(&hub);
    let (b, mut rx_b) = connect(&hub);
    hub.join("room", a);
    hub.join("room", b);

    hub.send_to_room_except("room", a, &event());
    assert_eq!(drain(&mut rx_a), 0);
    assert_eq!(drain(&mut rx_b), 1);
}

#[test]
fn absent_room_is_a_no_op() {
    let hub = Hub::new();
    let (_a, mut rx_a) = connect(&hub);
    hub.send_to_room("nobody-here", &event());
    assert_eq!(drain(&mut rx_a), 0);
}

#[test]
fn user_room_fanout_covers_multiple_connections_of_one_identity() {
    let hub = Hub::new();
    let user = UserId("u1".into());
    let (a, mut rx_a) = connect(&hub);
    let (b, mut rx_b) = connect(&hub);
    hub.join(&Hub::user_room(&user), a);
    hub.join(&Hub::user_room(&user), b);

    hub.send_to_user(&user, event());
    assert_eq!(drain(&mut rx_a), 1);
    assert_eq!(drain(&mut rx_b), 1);
}

#[test]
fn leave_stops_delivery_and_empty_rooms_are_dropped() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(&hub);
    hub.join("room", a);
    assert_eq!(hub.room_size("room"), 1);

    hub.leave("room", a);
    assert_eq!(hub.room_size("room"), 0);
    hub.send_to_room("room", &event());
    assert_eq!(drain(&mut rx_a), 0);
}

#[test]
fn unregister_removes_connection_from_every_room() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(&hub);
    let (b, mut rx_b) = connect(&hub);
    hub.join("room-1", a);
    hub.join("room-2", a);
    hub.join("room-1", b);

    hub.unregister(a);
    assert_eq!(hub.room_size("room-1"), 1);
    assert_eq!(hub.room_size("room-2"), 0);

    hub.send_to_room("room-1", &event());
    assert_eq!(drain(&mut rx_a), 0);
    assert_eq!(drain(&mut rx_b), 1);
}

#[test]
fn closed_receiver_never_errors_the_sender() {
    let hub = Hub::new();
    let (a, rx_a) = connect(&hub);
    hub.join("room", a);
    drop(rx_a);
    hub.send_to_room("room", &event());
    hub.send_to_connection(a, event());
}
