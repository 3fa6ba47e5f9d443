//! Frame sequences for the board's transitions
//!
//! Every SD route change starts with a reset pulse on the SD controller.
//! The mux pins are active-low towards the DUT.

use crate::channel::{CommandFrame, Level, Opcode, Pin, PinMode};

/// Settle time after switching the SD/USB muxes
pub const MUX_SETTLE_MS: u64 = 5000;

/// Settle time after switching the DUT supply
pub const VOUT_SETTLE_MS: u64 = 500;

/// Board initialisation after the ready signal
pub fn bring_up(vout_millivolts: u32) -> Vec<CommandFrame> {
    vec![
        CommandFrame::command(Opcode::EnableFaultReset).settle_ms(1000),
        CommandFrame::pin_mode(Pin::Led, PinMode::Output),
        CommandFrame::write_dac(vout_millivolts).settle_ms(1000),
        CommandFrame::command(Opcode::EnableVreg).settle_ms(1000),
        CommandFrame::pin_mode(Pin::SdMuxSelect, PinMode::Output),
        CommandFrame::pin_mode(Pin::UsbMuxSelect, PinMode::Output),
        CommandFrame::digital_write(Pin::SdMuxSelect, Level::Low),
        CommandFrame::digital_write(Pin::UsbMuxSelect, Level::Low),
    ]
}

fn sd_reset_pulse() -> [CommandFrame; 2] {
    [
        CommandFrame::command(Opcode::SdResetEnable).settle_ms(10),
        CommandFrame::command(Opcode::SdResetDisable),
    ]
}

/// Hand the SD card to the DUT
pub fn route_to_dut() -> Vec<CommandFrame> {
    let mut frames = sd_reset_pulse().to_vec();
    frames.extend([
        CommandFrame::digital_write(Pin::Led, Level::Low),
        CommandFrame::digital_write(Pin::SdMuxSelect, Level::Low),
        CommandFrame::digital_write(Pin::UsbMuxSelect, Level::Low).settle_ms(MUX_SETTLE_MS),
    ]);
    frames
}

/// Hand the SD card to the host
pub fn route_to_host() -> Vec<CommandFrame> {
    let mut frames = sd_reset_pulse().to_vec();
    frames.extend([
        CommandFrame::digital_write(Pin::Led, Level::High),
        CommandFrame::digital_write(Pin::SdMuxSelect, Level::High),
        CommandFrame::digital_write(Pin::UsbMuxSelect, Level::High).settle_ms(MUX_SETTLE_MS),
    ]);
    frames
}

pub fn vout_enable() -> CommandFrame {
    CommandFrame::command(Opcode::EnableVoutSwitch).settle_ms(VOUT_SETTLE_MS)
}

pub fn vout_disable() -> CommandFrame {
    CommandFrame::command(Opcode::DisableVoutSwitch).settle_ms(VOUT_SETTLE_MS)
}

/// Route the card to the DUT, then switch its supply on
pub fn power_on() -> Vec<CommandFrame> {
    let mut frames = route_to_dut();
    frames.push(vout_enable());
    frames
}

/// Switch the DUT supply off, then route the card back to the host
pub fn power_off() -> Vec<CommandFrame> {
    let mut frames = vec![vout_disable()];
    frames.extend(route_to_host());
    frames
}

/// Raw bytes of a sequence, for comparing against a recorded link
pub fn to_bytes(frames: &[CommandFrame]) -> Vec<[u8; 3]> {
    frames.iter().map(CommandFrame::to_bytes).collect()
}
