//! End-to-end tests: peer -> transport -> buffer -> stack -> consumers.

#[cfg(test)]
mod tests {
  use std::{
    collections::BTreeMap,
    sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
    },
  };

  use pretty_assertions::assert_eq;
  use serde_json::{Value, json};

  use crate::{
    __tests__::helpers::{Counter, WAIT, connect},
    Config, DispatchEvent, StackError,
    parser::{Demultiplexer, JsonFramer, Parser, StreamId},
  };

  type CounterStreams = Demultiplexer<Parser<JsonFramer<Counter>>>;

  // ==========================================================================
  // Multiplexed streams
  // ==========================================================================

  /// Five counters interleaved on one channel and written in a single flush
  /// each arrive at their own consumer, in order.
  #[tokio::test]
  async fn test_five_interleaved_counters() {
    let (dispatcher, mut peer) = connect(&Config::default());
    let demux = dispatcher.stack().add_new::<CounterStreams>();

    let mut consumers = Vec::new();
    for id in 0..5u32 {
      let parser = demux.parser_for(StreamId(id));
      let accept = dispatcher.accept_signal();
      consumers.push(tokio::spawn(async move {
        let mut received = Vec::new();
        while received.len() < 100 {
          let batch = parser.next_async().await;
          received.extend(batch.objects.into_iter().map(|c| c.number));
          accept.accept_next();
        }
        received
      }));
    }

    let lines: Vec<String> = (0..100u32)
      .flat_map(|i| (0..5u32).map(move |id| format!("{id} {{\"Number\": {i}}}")))
      .collect();
    peer.send_all(&lines).await;

    let expected: Vec<u32> = (0..100).collect();
    for (id, consumer) in consumers.into_iter().enumerate() {
      let received = tokio::time::timeout(WAIT, consumer)
        .await
        .expect("consumer stalled")
        .expect("consumer panicked");
      assert_eq!(received, expected, "stream {id}");
    }

    assert_eq!(
      demux.streams(),
      (0..5).map(StreamId).collect::<Vec<_>>()
    );
    dispatcher.stack().pop(&demux).unwrap();
    dispatcher.close().await;
  }

  /// A broken payload on one stream is logged and skipped; neighbours keep going
  /// and the peer is not sent a warning.
  #[tokio::test]
  async fn test_broken_stream_does_not_affect_others() {
    let (dispatcher, mut peer) = connect(&Config::default());
    let demux = dispatcher.stack().add_new::<CounterStreams>();
    let one = demux.parser_for(StreamId(1));

    peer.send_all(["2 }", "2 {\"Number\": \"x\"}", "1 {\"Number\": 5}"]).await;

    let batch = tokio::time::timeout(WAIT, one.next_async()).await.expect("stream 1 stalled");
    assert_eq!(batch.objects, vec![Counter { number: 5 }]);
    assert!(demux.parser_for(StreamId(2)).is_empty());

    dispatcher.stack().pop(&demux).unwrap();
    dispatcher.finish_run().await.unwrap();
    // Nothing was written before END
    assert_eq!(peer.recv().await, "END");
  }

  /// A single consumer driven by envelopes sees each stream end on its own.
  #[tokio::test]
  async fn test_stream_end_markers() {
    let (dispatcher, mut peer) = connect(&Config::default());
    let demux = dispatcher.stack().add_new::<CounterStreams>();

    peer
      .send_all(["0 {\"Number\": 1}", "1 {\"Number\": 2}", "0 END", "1 {\"Number\": 3}", "1 END"])
      .await;

    let mut numbers: BTreeMap<StreamId, Vec<u32>> = BTreeMap::new();
    let mut ended = Vec::new();
    while ended.len() < 2 {
      let envelope = tokio::time::timeout(WAIT, demux.next_envelope_async())
        .await
        .expect("no envelope");
      let batch = demux
        .parser_for(envelope.stream)
        .next()
        .expect("routed line should have produced a batch");
      dispatcher.accept_next();

      if batch.is_end {
        demux.remove(envelope.stream);
        ended.push(envelope.stream);
        continue;
      }
      numbers
        .entry(envelope.stream)
        .or_default()
        .extend(batch.objects.into_iter().map(|c| c.number));
    }

    assert_eq!(ended, vec![StreamId(0), StreamId(1)]);
    assert_eq!(numbers[&StreamId(0)], vec![1]);
    assert_eq!(numbers[&StreamId(1)], vec![2, 3]);
    assert!(demux.is_empty());
    dispatcher.close().await;
  }

  // ==========================================================================
  // Run lifecycle
  // ==========================================================================

  /// `run`, then a JSON object stream on a pushed framer, then END, pop and
  /// `finish_run`, then `quit`.
  #[tokio::test]
  async fn test_run_with_json_stream() {
    let (mut dispatcher, mut peer) = connect(&Config::default());

    peer.send("run collect").await;
    let event = tokio::time::timeout(WAIT, dispatcher.next_event()).await.expect("no event");
    assert_eq!(event, Some(DispatchEvent::Run("collect".to_string())));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let framer = Arc::new(Parser::new(JsonFramer::<Value>::new()).with_on_parsed(move |batch| {
      counter.fetch_add(batch.objects.len(), Ordering::SeqCst);
    }));
    dispatcher.stack().add(framer.clone());
    dispatcher.accept_next();

    peer
      .send_all(["{", "  \"a\": 1,", "  \"b\": {\"c\": [1, 2]}", "} {\"a\": 2}", "END"])
      .await;

    let mut objects = Vec::new();
    loop {
      let batch = tokio::time::timeout(WAIT, framer.next_async()).await.expect("framer stalled");
      if batch.is_end {
        break;
      }
      objects.extend(batch.objects);
      dispatcher.accept_next();
    }
    assert_eq!(objects, vec![json!({"a": 1, "b": {"c": [1, 2]}}), json!({"a": 2})]);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    let popped = dispatcher.stack().pop_typed::<Parser<JsonFramer<Value>>>().unwrap();
    assert!(Arc::ptr_eq(&popped, &framer));
    dispatcher.finish_run().await.unwrap();
    assert_eq!(peer.recv().await, "END");

    peer.send("quit").await;
    let event = tokio::time::timeout(WAIT, dispatcher.next_event()).await.expect("no event");
    assert_eq!(event, Some(DispatchEvent::Quit));
    dispatcher.quit().await;
    assert_eq!(peer.recv().await, "QUIT");
  }

  /// Pops out of order are refused and leave the root stack intact.
  #[tokio::test]
  async fn test_out_of_order_pop_is_refused() {
    let (dispatcher, _peer) = connect(&Config::default());
    let stack = dispatcher.stack();
    let framer = stack.add_new::<Parser<JsonFramer<Value>>>();
    let demux = stack.add_new::<CounterStreams>();

    assert!(matches!(stack.pop(&framer), Err(StackError::Mismatch { .. })));
    assert!(matches!(
      stack.pop_typed::<Parser<JsonFramer<Value>>>(),
      Err(StackError::TypeMismatch { .. })
    ));
    assert_eq!(stack.len(), 4);

    stack.pop(&demux).unwrap();
    stack.pop(&framer).unwrap();
    assert_eq!(stack.len(), 2);
    dispatcher.close().await;
  }
}
