//! End-to-end read cycles against the simulated meter

use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

use zivmeter_core::config::MeterConfig;
use zivmeter_core::demo::{DemoMeter, Drift};
use zivmeter_core::dlms::{DlmsCodec, LinkSettings};
use zivmeter_core::poller::{MeterPoller, ReadStep, State};
use zivmeter_core::protocol::{AttributeRef, CommunicationEngine, Transport};

type Readings = Rc<RefCell<Vec<(String, f64)>>>;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn attach_sinks(reads: &mut [ReadStep], readings: &Readings) {
    for read in reads.iter_mut() {
        let readings = Rc::clone(readings);
        let name = read.name.clone();
        read.sink = Some(Box::new(move |v: f64| readings.borrow_mut().push((name.clone(), v))));
    }
}

fn fixed_meter() -> DemoMeter {
    let mut meter = DemoMeter::default().with_seed(42);
    meter.set_register("1.0.1.8.0.255", 12345, Drift::Fixed);
    meter.set_register("1.0.2.8.0.255", 678, Drift::Fixed);
    meter.set_register("1.0.1.7.0.255", 500, Drift::Fixed);
    meter.set_register("1.0.2.7.0.255", 0, Drift::Fixed);
    meter
}

fn poller_for(meter: DemoMeter, config: &MeterConfig, readings: &Readings) -> MeterPoller<DemoMeter, DlmsCodec> {
    init_logging();
    let engine = CommunicationEngine::new(meter, DlmsCodec::new(config.link.clone()), config.engine.clone());
    let mut reads = config.read_steps();
    attach_sinks(&mut reads, readings);
    MeterPoller::new(engine, reads)
}

fn run_cycle(poller: &mut MeterPoller<DemoMeter, DlmsCodec>, tick_ms: u64) -> Vec<State> {
    let mut states = vec![poller.state()];
    for _ in 0..2000 {
        poller.advance();
        poller.engine_mut().transport_mut().advance_clock(tick_ms);
        if states.last() != Some(&poller.state()) {
            states.push(poller.state());
        }
        if poller.is_idle() {
            break;
        }
    }
    states
}

#[test]
fn test_default_config_reads_the_ziv_registers() {
    let config = MeterConfig::default();
    let readings = Readings::default();
    let mut poller = poller_for(fixed_meter(), &config, &readings);

    poller.update();
    let states = run_cycle(&mut poller, config.tick_interval_ms);

    assert_eq!(states.len(), 7);
    assert_eq!(states.last(), Some(&State::Idle));
    assert_eq!(
        *readings.borrow(),
        vec![
            ("Import energy".to_string(), 12345.0),
            ("Export energy".to_string(), 678.0),
            ("Import power".to_string(), 5000.0),
            ("Export power".to_string(), 0.0),
        ]
    );
    assert_eq!(poller.stats().completed_cycles, 1);
}

#[test]
fn test_optical_echo_is_ignored() {
    let config = MeterConfig::default();
    let readings = Readings::default();
    let mut meter = fixed_meter();
    meter.set_echo(true);
    let mut poller = poller_for(meter, &config, &readings);

    poller.update();
    run_cycle(&mut poller, config.tick_interval_ms);

    assert_eq!(poller.stats().completed_cycles, 1);
    assert_eq!(readings.borrow().len(), 4);
}

#[test]
fn test_silent_meter_fails_the_link_reset() {
    let config = MeterConfig::default();
    let readings = Readings::default();
    let mut meter = fixed_meter();
    meter.set_silent(true);
    let mut poller = poller_for(meter, &config, &readings);

    poller.update();
    let states = run_cycle(&mut poller, config.tick_interval_ms);

    assert_eq!(states, vec![State::LinkReset, State::Idle]);
    assert!(readings.borrow().is_empty());
    assert_eq!(poller.stats().failed_cycles, 1);
    assert_eq!(poller.stats().link_faults, 1);
    assert!(poller.engine().transport().now_ms() > config.engine.timeout_ms);
}

#[test]
fn test_corrupted_reply_fails_the_step() {
    let config = MeterConfig::default();
    let readings = Readings::default();
    let mut meter = fixed_meter();
    meter.corrupt_next_reply();
    let mut poller = poller_for(meter, &config, &readings);

    poller.update();
    let states = run_cycle(&mut poller, config.tick_interval_ms);

    assert_eq!(states, vec![State::LinkReset, State::Idle]);
    assert_eq!(poller.stats().failed_cycles, 1);
}

#[test]
fn test_wrong_password_stops_at_association() {
    let mut config = MeterConfig::default();
    config.link.password = "99999999".to_string();
    let readings = Readings::default();
    let meter = DemoMeter::new(&LinkSettings::default());
    let mut poller = poller_for(meter, &config, &readings);

    poller.update();
    let states = run_cycle(&mut poller, config.tick_interval_ms);

    assert_eq!(states, vec![State::LinkReset, State::Associate, State::Idle]);
    assert!(readings.borrow().is_empty());
    assert_eq!(poller.stats().link_faults, 0);
}

#[test]
fn test_unknown_register_fails_the_cycle() {
    let config = MeterConfig::default();
    let readings = Readings::default();
    let engine = CommunicationEngine::new(fixed_meter(), DlmsCodec::default(), config.engine.clone());
    let mut reads = vec![
        ReadStep::new("Import energy", AttributeRef::new("1.0.1.8.0.255", 2), 1.0),
        ReadStep::new("Voltage", AttributeRef::new("1.0.32.7.0.255", 2), 0.1),
        ReadStep::new("Import power", AttributeRef::new("1.0.1.7.0.255", 2), 10.0),
    ];
    attach_sinks(&mut reads, &readings);
    let mut poller = MeterPoller::new(engine, reads);

    poller.update();
    let states = run_cycle(&mut poller, config.tick_interval_ms);

    assert_eq!(states[states.len() - 2], State::Read(1));
    assert_eq!(*readings.borrow(), vec![("Import energy".to_string(), 12345.0)]);
}

#[test]
fn test_small_information_field_segments_the_request() {
    let mut config = MeterConfig::default();
    config.link.max_info_length = 24;
    let readings = Readings::default();
    let mut poller = poller_for(fixed_meter(), &config, &readings);

    poller.update();
    run_cycle(&mut poller, config.tick_interval_ms);

    assert_eq!(poller.stats().completed_cycles, 1);
    assert_eq!(readings.borrow().len(), 4);
    // AARQ split into three frames plus SNRM and four reads
    assert_eq!(poller.engine().transport().requests(), 8);
}

#[test]
fn test_repeated_cycles_with_drifting_counters() {
    let config = MeterConfig::default();
    let readings = Readings::default();
    let mut poller = poller_for(DemoMeter::default().with_seed(9), &config, &readings);

    for _ in 0..3 {
        poller.update();
        run_cycle(&mut poller, config.tick_interval_ms);
    }

    assert_eq!(poller.stats().completed_cycles, 3);
    let energy: Vec<f64> = readings
        .borrow()
        .iter()
        .filter(|(name, _)| name == "Import energy")
        .map(|(_, v)| *v)
        .collect();
    assert_eq!(energy.len(), 3);
    assert!(energy.windows(2).all(|w| w[0] <= w[1]), "{energy:?}");
}

#[test]
fn test_slow_line_spans_many_ticks() {
    let config = MeterConfig::default();
    let readings = Readings::default();
    let mut meter = fixed_meter();
    meter.set_bytes_per_ms(1);
    let mut poller = poller_for(meter, &config, &readings);

    poller.update();
    // One millisecond per tick: the reply to the last read arrives a byte at a time
    let mut sizes = Vec::new();
    for _ in 0..2000 {
        poller.advance();
        poller.engine_mut().transport_mut().advance_clock(1);
        if poller.state() == State::Read(3) {
            let size = poller.engine().receive_buffer().size();
            if size > 0 && sizes.last() != Some(&size) {
                sizes.push(size);
            }
        }
        if poller.is_idle() {
            break;
        }
    }

    assert!(poller.is_idle());
    assert_eq!(readings.borrow().len(), 4);
    assert!(sizes.len() >= 10, "{sizes:?}");
    assert!(sizes.windows(2).all(|w| w[1] == w[0] + 1), "{sizes:?}");
}
