//! D8 neighborhood tables shared by the flow algorithms

/// D8 flow directions (standard encoding)
///
/// ```text
///   4  3  2
///   5  0  1
///   6  7  8
/// ```
///
/// Odd codes are cardinal (E, N, W, S) and even codes are diagonal
/// (NE, NW, SW, SE). The flat resolver's tie-breaking relies on that
/// parity, so the tables here are indexed by direction code directly
/// (entry 0 is the unused NO_FLOW slot).
pub mod d8 {
    /// Direction offsets: (row_offset, col_offset), indexed by code 1-8
    pub const OFFSETS: [(isize, isize); 9] = [
        (0, 0),   // 0: no flow / pit
        (0, 1),   // 1: E
        (-1, 1),  // 2: NE
        (-1, 0),  // 3: N
        (-1, -1), // 4: NW
        (0, -1),  // 5: W
        (1, -1),  // 6: SW
        (1, 0),   // 7: S
        (1, 1),   // 8: SE
    ];

    /// Distance multipliers for each direction
    /// Cardinal directions = 1.0, diagonal = sqrt(2)
    pub const DISTANCES: [f64; 9] = [
        0.0,
        1.0,
        std::f64::consts::SQRT_2,
        1.0,
        std::f64::consts::SQRT_2,
        1.0,
        std::f64::consts::SQRT_2,
        1.0,
        std::f64::consts::SQRT_2,
    ];

    /// Get the opposite direction
    pub fn opposite(dir: u8) -> u8 {
        if dir == 0 {
            0
        } else {
            ((dir - 1 + 4) % 8) + 1
        }
    }

    /// Whether a direction code points to a cardinal (non-diagonal) neighbor
    pub fn is_cardinal(dir: u8) -> bool {
        dir % 2 == 1
    }
}
