use crate::input::Input;
use crate::ipc::{SupervisorMessage, WorkerEnd, WorkerMessage};
use crate::suite::{Sample, SuiteSet, Test};
use crate::sys;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::any::Any;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Exit code of a worker told to stop.
pub const EXIT_STOPPED: i32 = 0;
/// Exit code of a worker whose channel to the supervisor broke.
pub const EXIT_CHANNEL_LOST: i32 = 2;
/// Exit code of a worker whose own loop panicked outside the deploy boundary.
pub const EXIT_WORKER_PANIC: i32 = 3;

/// Extracts the message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Runs `test` on `data` inside the fault boundary. Returns the description
/// of an unrescued fault, or `None` if the deploy operation returned cleanly.
pub fn execute<I: Input>(test: &Test<I>, data: &I) -> Option<String> {
    match catch_unwind(AssertUnwindSafe(|| test.deploy(data))) {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(format!("{error:#}")),
        Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Entry point of a freshly forked worker. Never returns.
pub(crate) fn run<I: Input>(suites: &SuiteSet<I>, mut channel: WorkerEnd, seed: u64) -> ! {
    sys::reset_fatal_signals();
    sys::ignore_interrupts();
    // Unwinding past this point would resume the supervisor's frames in
    // the child.
    let code = match catch_unwind(AssertUnwindSafe(|| work(suites, &mut channel, seed))) {
        Ok(Ok(())) => EXIT_STOPPED,
        Ok(Err(_)) => EXIT_CHANNEL_LOST,
        Err(_) => EXIT_WORKER_PANIC,
    };
    sys::exit_immediately(code)
}

fn work<I: Input>(suites: &SuiteSet<I>, channel: &mut WorkerEnd, seed: u64) -> io::Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    loop {
        channel.send::<I>(&WorkerMessage::Claim)?;
        let sample_id = match channel.recv()? {
            Some(SupervisorMessage::Grant { sample_id }) => sample_id,
            Some(SupervisorMessage::Stop) | None => return Ok(()),
        };

        let (suite_idx, suite) = suites.choose(&mut rng);
        let test = suite.sample(&mut rng);

        let sample = match catch_unwind(AssertUnwindSafe(|| test.sample(&mut rng))) {
            Ok(sample) => sample,
            Err(payload) => {
                let generator = test.generator().name();
                channel.send::<I>(&WorkerMessage::Running {
                    sample_id,
                    suite: suite_idx as u32,
                    generator: generator.to_string(),
                    data: None,
                })?;
                let fault = format!(
                    "generator '{generator}' panicked: {}",
                    panic_message(payload.as_ref())
                );
                channel.send::<I>(&WorkerMessage::Finished {
                    sample_id,
                    fault: Some(fault),
                })?;
                continue;
            }
        };

        announce(channel, sample_id, suite_idx, &sample)?;
        let fault = execute(test, &sample.data);
        channel.send::<I>(&WorkerMessage::Finished { sample_id, fault })?;
    }
}

/// Sends `Running` for `sample`. Data that cannot be framed is announced as
/// unknown so the iteration still runs.
fn announce<I: Input>(
    channel: &mut WorkerEnd,
    sample_id: u64,
    suite_idx: usize,
    sample: &Sample<'_, I>,
) -> io::Result<()> {
    let running = WorkerMessage::Running {
        sample_id,
        suite: suite_idx as u32,
        generator: sample.generator.to_string(),
        data: Some(sample.data.clone()),
    };
    match channel.send(&running) {
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            channel.send::<I>(&WorkerMessage::Running {
                sample_id,
                suite: suite_idx as u32,
                generator: sample.generator.to_string(),
                data: None,
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{self, MAX_FRAME_LEN};
    use crate::suite::TestSuite;

    fn only_test(suite: &TestSuite<String>) -> &Test<String> {
        &suite.tests()[0]
    }

    #[test]
    fn clean_deploy_reports_nothing() {
        let suite = TestSuite::builder("ok")
            .deploy(|_data: &String| Ok(()))
            .data("1", || "a".to_string())
            .build()
            .unwrap();
        assert_eq!(execute(only_test(&suite), &"a".to_string()), None);
    }

    #[test]
    fn returned_error_is_a_fault() {
        let suite = TestSuite::builder("err")
            .deploy(|_data: &String| Err(anyhow::anyhow!("boo!")))
            .data("1", || "a".to_string())
            .build()
            .unwrap();
        assert_eq!(
            execute(only_test(&suite), &"a".to_string()).as_deref(),
            Some("boo!")
        );
    }

    #[test]
    fn panic_is_caught_at_the_boundary() {
        let suite = TestSuite::builder("panic")
            .deploy(|data: &String| panic!("Boom on {data}"))
            .data("1", || "a".to_string())
            .build()
            .unwrap();
        let fault = execute(only_test(&suite), &"a".to_string()).unwrap();
        assert!(fault.contains("Boom on a"), "unexpected fault: {fault}");
    }

    fn strict_parse(data: &str) -> u32 {
        data.parse().expect("boo!")
    }

    #[test]
    fn recovered_fault_is_invisible() {
        let suite = TestSuite::builder("rescued")
            .deploy(|data: &String| {
                let _ = catch_unwind(|| strict_parse(data));
                Ok(())
            })
            .data("1", || "a".to_string())
            .build()
            .unwrap();
        assert_eq!(execute(only_test(&suite), &"a".to_string()), None);
    }

    #[test]
    fn announce_sends_data_along() {
        let (mut supervisor, mut worker) = ipc::channel().unwrap();
        let sample = Sample {
            generator: "1",
            data: "a".to_string(),
        };
        announce(&mut worker, 3, 1, &sample).unwrap();
        assert_eq!(
            supervisor.recv::<String>().unwrap(),
            Some(WorkerMessage::Running {
                sample_id: 3,
                suite: 1,
                generator: "1".to_string(),
                data: Some("a".to_string()),
            })
        );
    }

    #[test]
    fn oversized_sample_is_announced_without_data() {
        let (mut supervisor, mut worker) = ipc::channel().unwrap();
        let sample = Sample {
            generator: "big",
            data: "a".repeat(MAX_FRAME_LEN + 1),
        };
        announce(&mut worker, 1, 0, &sample).unwrap();
        assert_eq!(
            supervisor.recv::<String>().unwrap(),
            Some(WorkerMessage::Running {
                sample_id: 1,
                suite: 0,
                generator: "big".to_string(),
                data: None,
            })
        );
    }

    #[test]
    fn panic_message_handles_payload_types() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(5u32);
        assert_eq!(panic_message(other.as_ref()), "Unknown panic type");
    }
}
