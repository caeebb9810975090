//! Host adapter behaviour under concurrent sessions

use std::sync::Arc;
use std::thread;

use piplate_spi::error::{EINTR, EINVAL, EIO};
use piplate_spi::host::ioc;
use piplate_spi::plates::{CMD_GET_ADDRESS, CMD_GET_ID, DAQC2, RELAY, TINKER};
use piplate_spi::transport::sim::{BusEvent, Fault, SimBus, SimPlate};
use piplate_spi::{
    CancelToken, Engine, EngineConfig, HostError, Message, PlateDevice, PIPLATE_SENDCMD,
};

fn device(bus: SimBus) -> Arc<PlateDevice<SimBus>> {
    Arc::new(PlateDevice::new(
        Engine::new(bus, EngineConfig::default()).unwrap(),
    ))
}

fn plates() -> SimBus {
    SimBus::with_plates([
        SimPlate::from_family(&RELAY, 0),
        SimPlate::from_family(&DAQC2, 2),
        SimPlate::from_family(&TINKER, 5),
    ])
}

#[test]
fn sendcmd_matches_iowr() {
    assert_eq!(PIPLATE_SENDCMD, ioc(3, b'Q', 0, 4));
    assert_eq!(PIPLATE_SENDCMD, 0xC004_5100);
}

#[test]
fn concurrent_sessions_never_interleave() {
    let bus = plates();
    let log = bus.event_log();
    let dev = device(bus);

    let workers: Vec<_> = [(24u8, false), (34, true), (53, true)]
        .into_iter()
        .map(|(addr, ack)| {
            let handle = dev.open();
            thread::spawn(move || {
                for _ in 0..25 {
                    let mut msg = Message::new(addr, CMD_GET_ADDRESS).with_ack(ack).returning(1);
                    handle.send(&mut msg).unwrap();
                    assert_eq!(msg.r_buf, vec![addr]);

                    let mut msg = Message::new(addr, CMD_GET_ID).with_ack(ack).returning(-1);
                    handle.send(&mut msg).unwrap();
                    assert!(msg.state);
                    assert_eq!(msg.r_buf.last(), Some(&0));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let spans = log.frame_spans();
    assert_eq!(spans.len(), 3 * 25 * 2);
    for span in spans {
        let commands: Vec<_> = span
            .iter()
            .filter_map(|e| match e {
                BusEvent::Command(frame) => Some(*frame),
                _ => None,
            })
            .collect();
        assert_eq!(commands.len(), 1);
        assert!(matches!(span[0], BusEvent::Command(_)));
    }
    assert!(log.unframed_traffic().is_empty());
    assert_eq!(dev.sessions(), 0);
}

#[test]
fn errors_map_to_driver_codes() {
    let mut bus = plates();
    bus.inject_always(Fault::CorruptChecksum);
    let dev = device(bus);
    let handle = dev.open();
    let cancel = CancelToken::new();

    let mut msg = Message::new(53, CMD_GET_ADDRESS).with_ack(true).returning(1);
    let err = handle.ioctl(PIPLATE_SENDCMD, &mut msg, &cancel).unwrap_err();
    assert!(matches!(err, HostError::Exchange(_)));
    assert_eq!(err.errno(), EIO);

    let err = handle.ioctl(PIPLATE_SENDCMD + 1, &mut msg, &cancel).unwrap_err();
    assert_eq!(err.errno(), EINVAL);

    let mut bad = Message::new(24, CMD_GET_ADDRESS).returning(-5);
    assert_eq!(handle.send(&mut bad).unwrap_err().errno(), EINVAL);

    assert_eq!(HostError::Interrupted.errno(), EINTR);
}

#[test]
fn non_ack_plate_unaffected_by_checksum_faults() {
    let mut bus = plates();
    bus.inject_always(Fault::CorruptChecksum);
    let handle = device(bus).open();

    let mut msg = Message::new(24, CMD_GET_ID).returning(-1);
    handle.send(&mut msg).unwrap();
    assert_eq!(msg.r_buf, b"Pi-Plate RELAY\0".to_vec());
}

#[test]
fn device_returns_engine() {
    let dev = device(plates());
    {
        let handle = dev.open();
        let mut msg = Message::new(24, 0x10).with_params(7, 1);
        handle.send(&mut msg).unwrap();
        assert!(msg.r_buf.is_empty());
    }

    let engine = match Arc::try_unwrap(dev) {
        Ok(dev) => dev.into_engine(),
        Err(_) => panic!("device still shared"),
    };
    let bus = engine.detach();
    assert_eq!(bus.event_log().commands(), vec![[24, 0x10, 7, 1]]);
    assert!(!bus.frame_asserted());
}
