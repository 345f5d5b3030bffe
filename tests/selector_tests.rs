//! Selector scenarios across threads, including fairness.

use std::thread;
use std::time::Duration;

use rendezvous::{Channel, SelectError, Selector};

#[test]
fn test_select_prefilled_channel() {
    let a = Channel::new(1);
    let b: Channel<i32> = Channel::new(1);
    a.send(42).unwrap();

    let mut sel = Selector::new();
    sel.recv(&a).recv(&b);
    assert_eq!(sel.select(), Ok(0));
    assert_eq!(sel.get_data::<i32>(), Some(42));
}

#[test]
fn test_select_blocks_until_send_arrives() {
    let a: Channel<i32> = Channel::new(0);
    let b: Channel<i32> = Channel::new(0);

    let tx = b.clone();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        tx.send(9)
    });

    let mut sel = Selector::new();
    sel.recv(&a).recv(&b);
    assert_eq!(sel.select(), Ok(1));
    assert_eq!(sel.get_data::<i32>(), Some(9));
    sender.join().unwrap().unwrap();
}

#[test]
fn test_select_send_offer_commits_to_receiver() {
    let chan: Channel<i32> = Channel::new(0);

    let rx = chan.clone();
    let receiver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        rx.recv()
    });

    let mut sel = Selector::new();
    sel.send(&chan, 5);
    assert_eq!(sel.select(), Ok(0));
    assert_eq!(sel.get_data::<i32>(), None);
    assert_eq!(receiver.join().unwrap(), Some(5));
}

#[test]
fn test_select_mixed_directions() {
    let produce: Channel<i32> = Channel::new(0);
    let consume: Channel<i32> = Channel::new(1);
    consume.send(3).unwrap();

    // the send side has no peer, so the ready receive must win
    let mut sel = Selector::new();
    sel.send(&produce, 1).recv(&consume);
    assert_eq!(sel.select(), Ok(1));
    assert_eq!(sel.get_data::<i32>(), Some(3));
}

#[test]
fn test_select_across_element_types() {
    let numbers: Channel<i32> = Channel::new(1);
    let labels: Channel<String> = Channel::new(1);
    labels.send("ready".to_string()).unwrap();

    let mut sel = Selector::new();
    sel.recv(&numbers).recv(&labels);
    assert_eq!(sel.select(), Ok(1));
    assert_eq!(sel.get_data::<String>(), Some("ready".to_string()));
}

#[test]
fn test_close_wakes_parked_selector() {
    let a: Channel<i32> = Channel::new(0);
    let b: Channel<i32> = Channel::new(0);

    let victim = a.clone();
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        victim.close();
    });

    // the close makes the receive offer ready as end-of-stream
    let mut sel = Selector::new();
    sel.recv(&a).recv(&b);
    assert_eq!(sel.select(), Ok(0));
    assert_eq!(sel.get_data::<i32>(), None);
    closer.join().unwrap();
}

#[test]
fn test_close_fails_parked_selector_send() {
    let chan: Channel<i32> = Channel::new(0);

    let victim = chan.clone();
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        victim.close();
    });

    let mut sel = Selector::new();
    sel.send(&chan, 1);
    assert_eq!(sel.select(), Err(SelectError::Closed));
    closer.join().unwrap();
}

#[test]
fn test_no_residual_registration_after_commit() {
    // commit on `a` while also registered on rendezvous channel `b`; a
    // leftover registration on `b` would corrupt the next pairing there
    let a: Channel<i32> = Channel::new(0);
    let b: Channel<i32> = Channel::new(0);

    let tx = a.clone();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        tx.send(8)
    });

    let mut sel = Selector::new();
    sel.recv(&a).recv(&b);
    assert_eq!(sel.select(), Ok(0));
    assert_eq!(sel.get_data::<i32>(), Some(8));
    sender.join().unwrap().unwrap();

    // b must now behave like a fresh rendezvous channel
    let tx = b.clone();
    let sender = thread::spawn(move || tx.send(11));
    assert_eq!(b.recv(), Some(11));
    sender.join().unwrap().unwrap();
}

#[test]
fn test_selector_reusable_across_rounds() {
    let chan = Channel::new(1);
    let mut sel = Selector::new();
    for round in 0..10 {
        chan.send(round).unwrap();
        sel.recv(&chan);
        assert_eq!(sel.select(), Ok(0));
        assert_eq!(sel.get_data::<i32>(), Some(round));
    }
}

#[test]
fn test_fairness_between_ready_offers() {
    // with two offers ready on every trial, each should win roughly half
    const TRIALS: usize = 400;
    let mut wins = [0usize; 2];
    for _ in 0..TRIALS {
        let a = Channel::new(1);
        let b = Channel::new(1);
        a.send(1).unwrap();
        b.send(2).unwrap();
        let mut sel = Selector::new();
        sel.recv(&a).recv(&b);
        let index = sel.select().unwrap();
        wins[index] += 1;
    }
    assert_eq!(wins[0] + wins[1], TRIALS);
    assert!(
        wins[0] > TRIALS / 5 && wins[1] > TRIALS / 5,
        "offer choice is biased: {wins:?}"
    );
}

#[test]
fn test_two_selectors_rendezvous_with_each_other() {
    let chan: Channel<i32> = Channel::new(0);

    let tx = chan.clone();
    let sender = thread::spawn(move || {
        let mut sel = Selector::new();
        sel.send(&tx, 21);
        sel.select()
    });

    let mut sel = Selector::new();
    sel.recv(&chan);
    assert_eq!(sel.select(), Ok(0));
    assert_eq!(sel.get_data::<i32>(), Some(21));
    assert_eq!(sender.join().unwrap(), Ok(0));
}
