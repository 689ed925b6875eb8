//! Operations on the five evaluation outputs.

use crate::nn::{
    Outputs, OUTPUT_LOSE_BACKGAMMON, OUTPUT_LOSE_GAMMON, OUTPUT_WIN, OUTPUT_WIN_BACKGAMMON,
    OUTPUT_WIN_GAMMON,
};

/// The same evaluation seen from the other player.
#[inline]
#[must_use]
pub fn invert(outputs: &Outputs) -> Outputs {
    [
        1.0 - outputs[OUTPUT_WIN],
        outputs[OUTPUT_LOSE_GAMMON],
        outputs[OUTPUT_LOSE_BACKGAMMON],
        outputs[OUTPUT_WIN_GAMMON],
        outputs[OUTPUT_WIN_BACKGAMMON],
    ]
}

/// Cubeless money equity: `2w - 1 + wg - lg + wbg - lbg`.
#[inline]
#[must_use]
pub fn cubeless_equity(outputs: &Outputs) -> f32 {
    2.0 * outputs[OUTPUT_WIN] - 1.0 + outputs[OUTPUT_WIN_GAMMON] - outputs[OUTPUT_LOSE_GAMMON]
        + outputs[OUTPUT_WIN_BACKGAMMON]
        - outputs[OUTPUT_LOSE_BACKGAMMON]
}

/// Force outputs into a consistent shape: every value in `[0, 1]`, gammons
/// no more likely than the game, backgammons no more likely than gammons.
pub fn sanity_check(outputs: &mut Outputs) {
    for v in outputs.iter_mut() {
        *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    }

    let win = outputs[OUTPUT_WIN];
    let lose = 1.0 - win;

    outputs[OUTPUT_WIN_GAMMON] = outputs[OUTPUT_WIN_GAMMON].min(win);
    outputs[OUTPUT_WIN_BACKGAMMON] = outputs[OUTPUT_WIN_BACKGAMMON].min(outputs[OUTPUT_WIN_GAMMON]);
    outputs[OUTPUT_LOSE_GAMMON] = outputs[OUTPUT_LOSE_GAMMON].min(lose);
    outputs[OUTPUT_LOSE_BACKGAMMON] = outputs[OUTPUT_LOSE_BACKGAMMON].min(outputs[OUTPUT_LOSE_GAMMON]);
}
