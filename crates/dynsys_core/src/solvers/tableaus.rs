//! Coefficients of the built-in explicit Runge-Kutta methods.
//!
//! Stage rows list only the entries below the diagonal; the first stage has
//! an empty row.

pub(super) struct StaticTableau {
    pub name: &'static str,
    pub order: u32,
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
}

pub(super) const EULER: StaticTableau = StaticTableau {
    name: "Euler",
    order: 1,
    a: &[&[]],
    b: &[1.0],
};

pub(super) const MIDPOINT: StaticTableau = StaticTableau {
    name: "Explicit midpoint",
    order: 2,
    a: &[&[], &[0.5]],
    b: &[0.0, 1.0],
};

pub(super) const RK4: StaticTableau = StaticTableau {
    name: "Runge-Kutta 4",
    order: 4,
    a: &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
};

pub(super) const DORMAND_PRINCE5: StaticTableau = StaticTableau {
    name: "Dormand-Prince 5",
    order: 5,
    a: &[
        &[],
        &[0.2],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
};

// DOP853 stages; the three dense-output stages are not needed for stepping.
pub(super) const DOP853: StaticTableau = StaticTableau {
    name: "DOP853",
    order: 8,
    a: &[
        &[],
        &[5.26001519587677318785587544488e-2],
        &[1.97250569845378994544595329183e-2, 5.91751709536136983633785987549e-2],
        &[2.95875854768068491816892993775e-2, 0.0, 8.87627564304205475450678981324e-2],
        &[
            2.41365134159266685502369798665e-1,
            0.0,
            -8.84549479328286085344864962717e-1,
            9.24834003261792003115737966543e-1,
        ],
        &[
            3.7037037037037037037037037037e-2,
            0.0,
            0.0,
            1.70828608729473871279604482173e-1,
            1.25467687566822425016691814123e-1,
        ],
        &[
            3.7109375e-2,
            0.0,
            0.0,
            1.70252211019544039314978060272e-1,
            6.02165389804559606850219397283e-2,
            -1.7578125e-2,
        ],
        &[
            3.70920001185047927108779319836e-2,
            0.0,
            0.0,
            1.70383925712239993810214054705e-1,
            1.07262030446373284651809199168e-1,
            -1.53194377486244017527936158236e-2,
            8.27378916381402288758473766002e-3,
        ],
        &[
            6.24110958716075717114429577812e-1,
            0.0,
            0.0,
            -3.36089262944694129406857109825e0,
            -8.68219346841726006818189891453e-1,
            2.75920996994467083049415600797e1,
            2.01540675504778934086186788979e1,
            -4.34898841810699588477366255144e1,
        ],
        &[
            4.77662536438264365890433908527e-1,
            0.0,
            0.0,
            -2.48811461997166764192642586468e0,
            -5.90290826836842996371446475743e-1,
            2.12300514481811942347288949897e1,
            1.52792336328824235832596922938e1,
            -3.32882109689848629194453265587e1,
            -2.03312017085086261358222928593e-2,
        ],
        &[
            -9.3714243008598732571704021658e-1,
            0.0,
            0.0,
            5.18637242884406370830023853209e0,
            1.09143734899672957818500254654e0,
            -8.14978701074692612513997267357e0,
            -1.85200656599969598641566180701e1,
            2.27394870993505042818970056734e1,
            2.49360555267965238987089396762e0,
            -3.0467644718982195003823669022e0,
        ],
        &[
            2.27331014751653820792359768449e0,
            0.0,
            0.0,
            -1.05344954667372501984066689879e1,
            -2.00087205822486249909675718444e0,
            -1.79589318631187989172765950534e1,
            2.79488845294199600508499808837e1,
            -2.85899827713502369474065508674e0,
            -8.87285693353062954433549289258e0,
            1.23605671757943030647266201528e1,
            6.43392746015763530355970484046e-1,
        ],
    ],
    b: &[
        5.42937341165687622380535766363e-2,
        0.0,
        0.0,
        0.0,
        0.0,
        4.45031289275240888144113950566e0,
        1.89151789931450038304281599044e0,
        -5.8012039600105847814672114227e0,
        3.1116436695781989440891606237e-1,
        -1.52160949662516078556178806805e-1,
        2.01365400804030348374776537501e-1,
        4.47106157277725905176885569043e-2,
    ],
};

const FEHLBERG78_A: &[&[f64]] = &[
    &[],
    &[2.0 / 27.0],
    &[1.0 / 36.0, 1.0 / 12.0],
    &[1.0 / 24.0, 0.0, 1.0 / 8.0],
    &[5.0 / 12.0, 0.0, -25.0 / 16.0, 25.0 / 16.0],
    &[1.0 / 20.0, 0.0, 0.0, 1.0 / 4.0, 1.0 / 5.0],
    &[-25.0 / 108.0, 0.0, 0.0, 125.0 / 108.0, -65.0 / 27.0, 125.0 / 54.0],
    &[31.0 / 300.0, 0.0, 0.0, 0.0, 61.0 / 225.0, -2.0 / 9.0, 13.0 / 900.0],
    &[2.0, 0.0, 0.0, -53.0 / 6.0, 704.0 / 45.0, -107.0 / 9.0, 67.0 / 90.0, 3.0],
    &[
        -91.0 / 108.0,
        0.0,
        0.0,
        23.0 / 108.0,
        -976.0 / 135.0,
        311.0 / 54.0,
        -19.0 / 60.0,
        17.0 / 6.0,
        -1.0 / 12.0,
    ],
    &[
        2383.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -301.0 / 82.0,
        2133.0 / 4100.0,
        45.0 / 82.0,
        45.0 / 164.0,
        18.0 / 41.0,
    ],
    &[
        3.0 / 205.0,
        0.0,
        0.0,
        0.0,
        0.0,
        -6.0 / 41.0,
        -3.0 / 205.0,
        -3.0 / 41.0,
        3.0 / 41.0,
        6.0 / 41.0,
    ],
    &[
        -1777.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -289.0 / 82.0,
        2193.0 / 4100.0,
        51.0 / 82.0,
        33.0 / 164.0,
        12.0 / 41.0,
        0.0,
        1.0,
    ],
];

// 13-stage Fehlberg pair; the two weight vectors share every stage.
pub(super) const FEHLBERG7: StaticTableau = StaticTableau {
    name: "Fehlberg 7",
    order: 7,
    a: FEHLBERG78_A,
    b: &[
        41.0 / 840.0,
        0.0,
        0.0,
        0.0,
        0.0,
        34.0 / 105.0,
        9.0 / 35.0,
        9.0 / 35.0,
        9.0 / 280.0,
        9.0 / 280.0,
        41.0 / 840.0,
        0.0,
        0.0,
    ],
};

pub(super) const FEHLBERG8: StaticTableau = StaticTableau {
    name: "Fehlberg 8",
    order: 8,
    a: FEHLBERG78_A,
    b: &[
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        34.0 / 105.0,
        9.0 / 35.0,
        9.0 / 35.0,
        9.0 / 280.0,
        9.0 / 280.0,
        0.0,
        41.0 / 840.0,
        41.0 / 840.0,
    ],
};

// Prince-Dormand RK8(7)13M; the order 7 and order 8 weights share every stage.
const PRINCE_DORMAND87_A: &[&[f64]] = &[
    &[],
    &[1.0 / 18.0],
    &[1.0 / 48.0, 1.0 / 16.0],
    &[1.0 / 32.0, 0.0, 3.0 / 32.0],
    &[5.0 / 16.0, 0.0, -75.0 / 64.0, 75.0 / 64.0],
    &[3.0 / 80.0, 0.0, 0.0, 3.0 / 16.0, 3.0 / 20.0],
    &[
        29443841.0 / 614563906.0,
        0.0,
        0.0,
        77736538.0 / 692538347.0,
        -28693883.0 / 1125000000.0,
        23124283.0 / 1800000000.0,
    ],
    &[
        16016141.0 / 946692911.0,
        0.0,
        0.0,
        61564180.0 / 158732637.0,
        22789713.0 / 633445777.0,
        545815736.0 / 2771057229.0,
        -180193667.0 / 1043307555.0,
    ],
    &[
        39632708.0 / 573591083.0,
        0.0,
        0.0,
        -433636366.0 / 683701615.0,
        -421739975.0 / 2616292301.0,
        100302831.0 / 723423059.0,
        790204164.0 / 839813087.0,
        800635310.0 / 3783071287.0,
    ],
    &[
        246121993.0 / 1340847787.0,
        0.0,
        0.0,
        -37695042795.0 / 15268766246.0,
        -309121744.0 / 1061227803.0,
        -12992083.0 / 490766935.0,
        6005943493.0 / 2108947869.0,
        393006217.0 / 1396673457.0,
        123872331.0 / 1001029789.0,
    ],
    &[
        -1028468189.0 / 846180014.0,
        0.0,
        0.0,
        8478235783.0 / 508512852.0,
        1311729495.0 / 1432422823.0,
        -10304129995.0 / 1701304382.0,
        -48777925059.0 / 3047939560.0,
        15336726248.0 / 1032824649.0,
        -45442868181.0 / 3398467696.0,
        3065993473.0 / 597172653.0,
    ],
    &[
        185892177.0 / 718116043.0,
        0.0,
        0.0,
        -3185094517.0 / 667107341.0,
        -477755414.0 / 1098053517.0,
        -703635378.0 / 230739211.0,
        5731566787.0 / 1027545527.0,
        5232866602.0 / 850066563.0,
        -4093664535.0 / 808688257.0,
        3962137247.0 / 1805957418.0,
        65686358.0 / 487910083.0,
    ],
    &[
        403863854.0 / 491063109.0,
        0.0,
        0.0,
        -5068492393.0 / 434740067.0,
        -411421997.0 / 543043805.0,
        652783627.0 / 914296604.0,
        11173962825.0 / 925320556.0,
        -13158990841.0 / 6184727034.0,
        3936647629.0 / 1978049680.0,
        -160528059.0 / 685178525.0,
        248638103.0 / 1413531060.0,
        0.0,
    ],
];

pub(super) const DORMAND_PRINCE7: StaticTableau = StaticTableau {
    name: "Dormand-Prince 7",
    order: 7,
    a: PRINCE_DORMAND87_A,
    b: &[
        13451932.0 / 455176623.0,
        0.0,
        0.0,
        0.0,
        0.0,
        -808719846.0 / 976000145.0,
        1757004468.0 / 5645159321.0,
        656045339.0 / 265891186.0,
        -3867574721.0 / 1518517206.0,
        465885868.0 / 322736535.0,
        53011238.0 / 667516719.0,
        2.0 / 45.0,
        0.0,
    ],
};

pub(super) const DORMAND_PRINCE8: StaticTableau = StaticTableau {
    name: "Dormand-Prince 8",
    order: 8,
    a: PRINCE_DORMAND87_A,
    b: &[
        14005451.0 / 335480064.0,
        0.0,
        0.0,
        0.0,
        0.0,
        -59238493.0 / 1068277825.0,
        181606767.0 / 758867731.0,
        561292985.0 / 797845732.0,
        -1041891430.0 / 1371343529.0,
        760417239.0 / 1151165299.0,
        118820643.0 / 751138087.0,
        -528747749.0 / 2220607170.0,
        1.0 / 4.0,
    ],
};
