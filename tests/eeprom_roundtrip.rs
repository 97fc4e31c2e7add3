//! Calibration-record behavior against the mock transport: format-gated
//! parsing, forward migration on write, default substitution, and the two
//! commit paths.

use std::sync::Arc;

use spectro_daq::eeprom::layout::{FORMAT_LATEST, FORMAT_OFFSET, FORMAT_PAGE, PAGE_COUNT};
use spectro_daq::eeprom::{Eeprom, Subformat};
use spectro_daq::error::EepromError;
use spectro_daq::protocol::CommandLink;
use spectro_daq::transport::mock::MockTransport;
use spectro_daq::transport::TransportKind;

fn sample_record() -> Eeprom {
    let mut rec = Eeprom::default_record();
    rec.model = "WP-785X".into();
    rec.serial_number = "WP-00412".into();
    rec.has_laser = true;
    rec.excitation_nm = 784.72;
    rec.startup_integration_ms = 25;
    rec.wavecal_coeffs = [780.2, 0.151, -3.2e-6, 1.1e-10, 2.0e-14];
    rec.linearity_coeffs = [1.0, 1.5e-6, 0.0, 0.0, 0.0];
    rec.laser_power_coeffs = [0.5, 2.0, 0.0, 0.0];
    rec.active_pixels_horizontal = 1024;
    rec.actual_pixels_horizontal = 1044;
    rec.min_integration_ms = 3;
    rec.max_integration_ms = 120_000;
    rec.avg_resolution = 0.35;
    rec.set_bad_pixels(&[12, 900]);
    rec.set_user_text("pos=1; feature=trigger");
    rec.default_values = false;
    rec.rebuild_derived();
    rec
}

fn link(transport: MockTransport) -> CommandLink {
    CommandLink::new(Arc::new(transport))
}

#[tokio::test]
async fn latest_format_round_trip() {
    let rec = sample_record();
    let l = link(MockTransport::fx2().with_record(&rec));
    let back = Eeprom::read(&l).await;

    assert!(!back.default_values);
    assert_eq!(back.format, FORMAT_LATEST);
    assert_eq!(back.model, "WP-785X");
    assert_eq!(back.serial_number, "WP-00412");
    assert_eq!(back.wavecal_coeffs, rec.wavecal_coeffs);
    assert_eq!(back.min_integration_ms, 3);
    assert_eq!(back.max_integration_ms, 120_000);
    assert_eq!(back.avg_resolution, 0.35);
    assert_eq!(back.bad_pixel_set(), rec.bad_pixel_set());
    assert_eq!(back.user_text(), "pos=1; feature=trigger");
    assert!((back.excitation_nm - 784.72).abs() < 1e-4);
}

#[tokio::test]
async fn older_formats_gate_newer_fields() {
    // Same rendered bytes, re-stamped as earlier revisions.
    for format in [3u8, 5, 7] {
        let mut pages = sample_record().render_pages();
        pages[FORMAT_PAGE][FORMAT_OFFSET] = format;
        let l = link(MockTransport::fx2().with_pages(pages));
        let back = Eeprom::read(&l).await;

        assert_eq!(back.format, format);
        // The fifth wavelength coefficient only exists at format 8.
        assert_eq!(back.wavecal_coeffs[4], 0.0);
        if format >= 7 {
            assert_eq!(back.avg_resolution, 0.35);
        } else {
            assert_eq!(back.avg_resolution, 0.0);
        }
        if format >= 5 {
            assert_eq!(back.max_integration_ms, 120_000);
        } else {
            // Legacy 16-bit slots on page 2, saturated by the renderer.
            assert_eq!(back.min_integration_ms, 3);
            assert_eq!(back.max_integration_ms, u32::from(u16::MAX));
        }
    }
}

#[tokio::test]
async fn write_migrates_forward_and_preserves_fields() {
    let mut pages = sample_record().render_pages();
    pages[FORMAT_PAGE][FORMAT_OFFSET] = 5;
    let transport = Arc::new(MockTransport::fx2().with_pages(pages));
    let l = CommandLink::new(transport.clone());

    let mut rec = Eeprom::read(&l).await;
    assert_eq!(rec.format, 5);

    rec.write(&l).await.unwrap();
    assert_eq!(rec.format, FORMAT_LATEST);
    assert_eq!(
        transport.committed_pages()[FORMAT_PAGE][FORMAT_OFFSET],
        FORMAT_LATEST
    );

    let back = Eeprom::read(&l).await;
    assert_eq!(back.format, FORMAT_LATEST);
    assert_eq!(back.serial_number, "WP-00412");
    assert_eq!(back.min_integration_ms, 3);
    assert_eq!(back.max_integration_ms, 120_000);
    assert_eq!(back.wavecal_coeffs[..4], sample_record().wavecal_coeffs[..4]);
}

#[tokio::test]
async fn blank_part_substitutes_defaults_but_stays_provisionable() {
    // Fresh mock: all pages 0xFF, format byte 0xFF.
    let l = link(MockTransport::fx2());
    let mut rec = Eeprom::read(&l).await;

    assert!(rec.default_values);
    assert_eq!(rec.wavecal_coeffs, [0.0, 1.0, 0.0, 0.0, 0.0]);
    assert_eq!(rec.min_integration_ms, 1);

    // The page cache was fetched, so factory provisioning can proceed.
    rec.serial_number = "WP-NEW".into();
    rec.write(&l).await.unwrap();
    let back = Eeprom::read(&l).await;
    assert_eq!(back.serial_number, "WP-NEW");
    assert!(!back.default_values);
}

#[tokio::test]
async fn failed_page_fetch_substitutes_defaults_and_blocks_write() {
    let transport = Arc::new(MockTransport::fx2().with_record(&sample_record()));
    transport.inject_page_failure(2);
    let l = CommandLink::new(transport);

    let mut rec = Eeprom::read(&l).await;
    assert!(rec.default_values);

    // No page cache from a failed read: a blind write must be refused.
    assert!(matches!(
        rec.write(&l).await,
        Err(EepromError::NotRead)
    ));
}

#[tokio::test]
async fn spi_write_stages_then_commits_every_page() {
    let rec = sample_record();
    let transport = Arc::new(
        MockTransport::fx2()
            .with_kind(TransportKind::Spi)
            .with_record(&rec),
    );
    let l = CommandLink::new(transport.clone());

    let mut rec = Eeprom::read(&l).await;
    rec.set_user_text("pos=3");
    rec.write(&l).await.unwrap();

    assert_eq!(transport.commit_count() as usize, PAGE_COUNT);
    let back = Eeprom::read(&l).await;
    assert_eq!(back.user_text(), "pos=3");
}

#[tokio::test]
async fn arm_board_write_succeeds_through_inverted_acks() {
    let rec = sample_record();
    let l = link(MockTransport::arm().with_record(&rec));
    let mut rec = Eeprom::read(&l).await;
    rec.write(&l).await.unwrap();
}

#[tokio::test]
async fn intensity_calibration_survives_round_trip() {
    let mut rec = sample_record();
    rec.subformat = Subformat::IntensityCalibration;
    rec.intensity_correction_order = 3;
    rec.intensity_correction_coeffs = vec![1.0, 0.1, 0.01, 0.001];
    rec.set_user_text("pos=0");
    rec.rebuild_derived();

    let l = link(MockTransport::fx2().with_record(&rec));
    let back = Eeprom::read(&l).await;
    assert_eq!(back.subformat, Subformat::IntensityCalibration);
    assert_eq!(back.intensity_correction_coeffs, vec![1.0, 0.1, 0.01, 0.001]);
    // User data restricted to page 4 under this subformat.
    assert_eq!(back.user_text(), "pos=0");
    assert_eq!(back.user_data_capacity(), 64);
}
