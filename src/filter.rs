use anyhow::{anyhow, Result};
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};

/// Cutoff of the post-mix high-pass that strips DC and sub-bass build-up.
pub const HIGH_PASS_CUTOFF: f32 = 20.0;

/// Fixed second-order Butterworth high-pass applied to the voice mix.
///
/// Its state carries over between blocks, so it must be fed one continuous
/// stream.
pub struct HighPass {
    filter: DirectForm2Transposed<f32>,
}

impl HighPass {
    pub fn new(sample_rate: f32) -> Result<Self> {
        let coeffs = Coefficients::<f32>::from_params(
            Type::HighPass,
            sample_rate.hz(),
            HIGH_PASS_CUTOFF.hz(),
            Q_BUTTERWORTH_F32,
        )
        .map_err(|e| anyhow!("no high-pass at {} Hz sample rate: {:?}", sample_rate, e))?;

        Ok(Self {
            filter: DirectForm2Transposed::<f32>::new(coeffs),
        })
    }

    pub fn process(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            *sample = self.filter.run(*sample);
        }
    }
}

fn tanhxdx(x: f64) -> f64 {
    // x.tanh() / x
    let a = x * x;
    ((a + 105.0) * a + 945.0) / ((15.0 * a + 420.0) * a + 945.0)
}

//// LICENSE TERMS: Copyright 2012 Teemu Voipio
//
// You can use this however you like for pretty much any purpose,
// as long as you don't claim you wrote it. There is no warranty.
//
// Distribution of substantial portions of this code in source form
// must include this copyright notice and list of conditions.
//
// From https://www.kvraudio.com/forum/viewtopic.php?f=33&t=349859.
/// Non-linear four-pole transistor ladder low-pass, one per voice.
#[derive(Clone, Debug)]
pub struct LadderFilter {
    sample_rate: f64,
    zi: f64,
    s: [f64; 4],
    f: f64,
    r: f64,
}

impl LadderFilter {
    pub fn new(sample_rate: f32) -> Self {
        let mut filter = Self {
            sample_rate: sample_rate as f64,
            zi: 0.0,
            s: [0.0; 4],
            f: 0.0,
            r: 0.0,
        };

        filter.set_cutoff(1000.0);
        filter.set_resonance(0.0);
        filter
    }

    /// Cutoff in Hz, kept below Nyquist.
    pub fn set_cutoff(&mut self, cutoff: f32) {
        let cutoff = (cutoff as f64).clamp(1.0, 0.45 * self.sample_rate);
        self.f = (cutoff / self.sample_rate * std::f64::consts::PI).tan();
    }

    /// Resonance in [0, 1]; self-oscillation starts near 0.9.
    pub fn set_resonance(&mut self, resonance: f32) {
        self.r = 40.0 / 9.0 * resonance.clamp(0.0, 1.0) as f64;
    }

    pub fn process(&mut self, sample: f32) -> f32 {
        let sample = sample as f64;

        // Input with half delay, for non-linearities.
        let ih = 0.5 * (sample + self.zi);
        self.zi = sample;

        // Evaluate the non-linear gains.
        let t0 = tanhxdx(ih - self.r * self.s[3]);
        let t1 = tanhxdx(self.s[0]);
        let t2 = tanhxdx(self.s[1]);
        let t3 = tanhxdx(self.s[2]);
        let t4 = tanhxdx(self.s[3]);

        // G# the denominators for solutions of individual stages.
        let g0 = 1.0 / (1.0 + self.f * t1);
        let g1 = 1.0 / (1.0 + self.f * t2);
        let g2 = 1.0 / (1.0 + self.f * t3);
        let g3 = 1.0 / (1.0 + self.f * t4);

        // F# are just factored out of the feedback solution.
        let f3 = self.f * t3 * g3;
        let f2 = self.f * t2 * g2 * f3;
        let f1 = self.f * t1 * g1 * f2;
        let f0 = self.f * t0 * g0 * f1;

        // Solve feedback.
        let y3 = (g3 * self.s[3]
            + f3 * g2 * self.s[2]
            + f2 * g1 * self.s[1]
            + f1 * g0 * self.s[0]
            + f0 * sample)
            / (1.0 + self.r * f0);

        // Then solve the remaining outputs (with the non-linear gains here).
        let xx = t0 * (sample - self.r * y3);
        let y0 = t1 * g0 * (self.s[0] + self.f * xx);
        let y1 = t2 * g1 * (self.s[1] + self.f * y0);
        let y2 = t3 * g2 * (self.s[2] + self.f * y1);

        // update state
        self.s[0] += 2.0 * self.f * (xx - y0);
        self.s[1] += 2.0 * self.f * (y0 - y1);
        self.s[2] += 2.0 * self.f * (y1 - y2);
        self.s[3] += 2.0 * self.f * (y2 - t4 * y3);

        y3 as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oscillator::{Oscillator, Waveform};

    const SAMPLE_RATE: f32 = 44_100.0;

    fn sine(frequency: f32, samples: usize) -> Vec<f32> {
        let mut osc = Oscillator::new(SAMPLE_RATE, Waveform::Sine);
        osc.set_frequency(frequency);
        let mut buf = vec![0.0; samples];
        osc.render(&mut buf);
        buf
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
    }

    #[test]
    fn high_pass_removes_dc() {
        let mut hp = HighPass::new(SAMPLE_RATE).unwrap();
        let mut buf = vec![0.5; 44_100];
        hp.process(&mut buf);
        assert!(buf[44_099].abs() < 1e-3, "dc left: {}", buf[44_099]);
    }

    #[test]
    fn high_pass_keeps_audible_band() {
        let mut hp = HighPass::new(SAMPLE_RATE).unwrap();
        let mut buf = sine(440.0, 8192);
        hp.process(&mut buf);
        let settled = peak(&buf[4096..]);
        assert!(settled > 0.98 && settled < 1.02, "peak {}", settled);
    }

    #[test]
    fn high_pass_state_carries_across_blocks() {
        let input = sine(35.0, 4096);

        let mut whole = HighPass::new(SAMPLE_RATE).unwrap();
        let mut a = input.clone();
        whole.process(&mut a);

        let mut split = HighPass::new(SAMPLE_RATE).unwrap();
        let mut b = input;
        let (head, tail) = b.split_at_mut(1000);
        split.process(head);
        split.process(tail);

        assert_eq!(a, b);
    }

    #[test]
    fn high_pass_rejects_impossible_rate() {
        assert!(HighPass::new(30.0).is_err());
    }

    #[test]
    fn ladder_attenuates_above_cutoff() {
        let mut lp = LadderFilter::new(SAMPLE_RATE);
        lp.set_cutoff(300.0);

        let filtered: Vec<f32> = sine(5000.0, 4096)
            .into_iter()
            .map(|s| 0.5 * s)
            .map(|s| lp.process(s))
            .collect();

        assert!(peak(&filtered[1024..]) < 0.01);
    }

    #[test]
    fn ladder_passes_below_cutoff() {
        let mut lp = LadderFilter::new(SAMPLE_RATE);
        lp.set_cutoff(5000.0);

        let filtered: Vec<f32> = sine(100.0, 8192)
            .into_iter()
            .map(|s| 0.25 * s)
            .map(|s| lp.process(s))
            .collect();

        let p = peak(&filtered[4096..]);
        assert!(p > 0.2 && p < 0.3, "peak {}", p);
    }
}
