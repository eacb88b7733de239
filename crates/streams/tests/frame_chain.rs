//! Generator -> framer -> counter, as one chain: frames come out aligned
//! no matter how the block boundaries fall.

use std::sync::{Arc, Mutex};

use chain::{Chain, SyncEnvelope};
use streams::check::{frame_counter, tagged_frame_counter};
use streams::framer::{framer, FramerArgs};
use streams::gen::{frame_pattern_gen, GenArgs};
use vlbi_types::{Frame, FrameLayout, Tagged};

#[test]
fn mark5b_frames_survive_reblocking() {
    let layout = FrameLayout::mark5b(32);
    let nframes = 200u64;

    let mut c = Chain::new();
    let gl = layout.clone();
    c.add_producer(8, move || GenArgs::new(gl.clone(), nframes, 7), frame_pattern_gen)
        .unwrap();
    let fl = layout.clone();
    c.add_stage(8, move || FramerArgs::new(fl.clone()), framer::<Frame>)
        .unwrap();
    let sink = c.add_consumer(|| 0u64, frame_counter).unwrap();

    let count = Arc::new(Mutex::new(0u64));
    {
        let count = Arc::clone(&count);
        c.register_cleanup(&sink, move |env: &SyncEnvelope<u64>| {
            if let Some(n) = env.lock().user_opt() {
                *count.lock().unwrap() = *n;
            }
        })
        .unwrap();
    }

    c.run().unwrap();
    c.wait();
    assert_eq!(*count.lock().unwrap(), nframes);
}

#[test]
fn vdif_frames_carry_their_thread_tag() {
    let layout = FrameLayout::vdif(8, 8032);
    let nframes = 64u64;

    let mut c = Chain::new();
    let gl = layout.clone();
    c.add_producer(8, move || GenArgs::new(gl.clone(), nframes, 16), frame_pattern_gen)
        .unwrap();
    let fl = layout.clone();
    c.add_stage(8, move || FramerArgs::new(fl.clone()), framer::<Tagged<Frame>>)
        .unwrap();
    let sink = c
        .add_consumer(std::collections::HashMap::new, tagged_frame_counter)
        .unwrap();

    let per_tag = Arc::new(Mutex::new(std::collections::HashMap::new()));
    {
        let per_tag = Arc::clone(&per_tag);
        c.register_cleanup(
            &sink,
            move |env: &SyncEnvelope<std::collections::HashMap<u64, u64>>| {
                if let Some(m) = env.lock().user_opt() {
                    *per_tag.lock().unwrap() = m.clone();
                }
            },
        )
        .unwrap();
    }

    c.run().unwrap();
    c.wait();
    let m = per_tag.lock().unwrap();
    // the generator writes thread id 0 into every header
    assert_eq!(m.get(&0).copied(), Some(nframes));
    assert_eq!(m.len(), 1);
}
