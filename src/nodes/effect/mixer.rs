//! Bus summing shared by groups and the endpoint.

use dasp_graph::{Buffer, Input};

/// Sum every input into `output`, channel by channel.
///
/// Attachment only links buses of the same shape, so every input carries as
/// many channels as `output`.
pub(crate) fn mix_inputs(inputs: &[Input], output: &mut [Buffer]) {
    mix_into(output, inputs.iter().map(Input::buffers));
}

fn mix_into<'a>(output: &mut [Buffer], sources: impl Iterator<Item = &'a [Buffer]>) {
    for buf in output.iter_mut() {
        buf.silence();
    }

    for buffers in sources {
        debug_assert_eq!(buffers.len(), output.len());
        for (out_buf, in_buf) in output.iter_mut().zip(buffers) {
            for (out_sample, in_sample) in out_buf.iter_mut().zip(in_buf.iter()) {
                *out_sample += *in_sample;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(v: f32) -> Buffer {
        let mut b = Buffer::SILENT;
        b.iter_mut().for_each(|s| *s = v);
        b
    }

    #[test]
    fn sums_per_channel() {
        let a = [filled(0.25), filled(-0.25)];
        let b = [filled(0.5), Buffer::SILENT];

        let mut out = [Buffer::SILENT, filled(9.0)];
        mix_into(&mut out, [&a[..], &b[..]].into_iter());
        assert!(out[0].iter().all(|&s| s == 0.75));
        assert!(out[1].iter().all(|&s| s == -0.25));
    }

    #[test]
    fn no_inputs_is_silence() {
        let mut out = [filled(1.0)];
        mix_into(&mut out, core::iter::empty());
        assert!(out[0].iter().all(|&s| s == 0.0));
    }
}
